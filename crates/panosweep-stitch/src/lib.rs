//! panosweep-stitch: pure panorama stitching engine (sans-IO).
//!
//! Turns an ordered sequence of overlapping frames into one panorama:
//! registration scaling -> feature extraction -> pairwise matching ->
//! camera estimation -> optional wave correction -> warping -> exposure
//! compensation -> seam finding -> blending -> cropping.
//!
//! This crate has **no I/O dependencies**. It works on in-memory rasters
//! and returns in-memory rasters; loading and saving lives in
//! `panosweep-io`, and session state lives in `panosweep-session`.

pub mod blend;
pub mod camera;
pub mod diagnostics;
pub mod exposure;
pub mod features;
pub mod graph;
pub mod homography;
pub mod matcher;
pub mod pairs;
pub mod pipeline;
pub mod pyramid;
pub mod refine;
pub mod scale;
pub mod seam;
pub mod synthetic;
pub mod types;
pub mod warp;
pub mod wave;

use tracing::warn;

pub use blend::{Blender, BlenderKind};
pub use diagnostics::{Clock, StitchDiagnostics, SystemClock, stitch_with_diagnostics};
pub use pipeline::Pipeline;
pub use types::{
    Dimensions, Frame, FrameSequence, GrayImage, RgbImage, StitchConfig, StitchError,
    StitchOptions, StitchResult, WarpSurface,
};

/// Stitch `frames` into a panorama, keeping the reason on failure.
///
/// A single frame is returned unchanged; everything else runs the full
/// [`Pipeline`].
///
/// # Errors
///
/// - [`StitchError::InvalidConfig`] if `config` fails validation.
/// - [`StitchError::InputTooSmall`] for an empty sequence, fewer than two
///   frames with enough features, or frames that all show the same view.
/// - [`StitchError::InsufficientOverlap`] if the frames do not form one
///   connected overlap graph.
/// - [`StitchError::ConvergenceFailure`] if camera estimation fails.
/// - [`StitchError::DegenerateOutput`] if the composite is empty or larger
///   than `config.max_output_pixels`.
pub fn try_stitch(
    frames: &FrameSequence,
    options: StitchOptions,
    config: &StitchConfig,
) -> Result<RgbImage, StitchError> {
    config.validate()?;
    match frames.frames() {
        [] => Err(StitchError::InputTooSmall {
            usable: 0,
            required: 1,
        }),
        [single] => Ok(single.image().clone()),
        _ => Ok(Pipeline::new(frames.clone(), options, config.clone())
            .detect_features()?
            .match_pairs()?
            .estimate_cameras()?
            .straighten()
            .warp()?
            .compensate_exposure()
            .find_seams()
            .blend()?
            .into_panorama()),
    }
}

/// [`try_stitch`] with an explicit config, collapsed to a [`StitchResult`].
///
/// The failure reason is logged at warn level before it is dropped.
#[must_use]
pub fn stitch_with_config(
    frames: &FrameSequence,
    options: StitchOptions,
    config: &StitchConfig,
) -> StitchResult {
    match try_stitch(frames, options, config) {
        Ok(panorama) => StitchResult::Stitched(std::sync::Arc::new(panorama)),
        Err(e) => {
            warn!(
                kind = e.kind(),
                frames = frames.len(),
                wave_correct = options.wave_correct,
                multi_band = options.multi_band,
                "stitch failed: {e}"
            );
            StitchResult::Failed
        }
    }
}

/// Stitch with the default config.
#[must_use]
pub fn stitch(frames: &FrameSequence, options: StitchOptions) -> StitchResult {
    stitch_with_config(frames, options, &StitchConfig::default())
}

/// Plain-image entry point: `None` is the only failure signal.
#[must_use]
pub fn stitch_images(
    images: &[RgbImage],
    wave_correct: bool,
    multi_band: bool,
) -> Option<RgbImage> {
    let frames: FrameSequence = images.iter().cloned().map(Frame::new).collect();
    match stitch(&frames, StitchOptions::new(wave_correct, multi_band)) {
        StitchResult::Stitched(panorama) => {
            Some(std::sync::Arc::try_unwrap(panorama).unwrap_or_else(|shared| (*shared).clone()))
        }
        StitchResult::Failed => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_sequence_is_too_small() {
        let result = try_stitch(
            &FrameSequence::default(),
            StitchOptions::default(),
            &StitchConfig::default(),
        );
        assert!(matches!(result, Err(StitchError::InputTooSmall { usable: 0, .. })));
    }

    #[test]
    fn single_frame_passes_through() {
        let image = RgbImage::from_fn(7, 5, |x, y| {
            image::Rgb([u8::try_from(x).unwrap(), u8::try_from(y).unwrap(), 3])
        });
        let out = stitch_images(std::slice::from_ref(&image), true, false).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn invalid_config_is_reported_before_work() {
        let config = StitchConfig {
            max_features: 0,
            ..StitchConfig::default()
        };
        let result = try_stitch(&FrameSequence::default(), StitchOptions::default(), &config);
        assert!(matches!(result, Err(StitchError::InvalidConfig(_))));
    }

    #[test]
    fn failures_collapse_to_marker() {
        assert!(!stitch(&FrameSequence::default(), StitchOptions::default()).is_stitched());
        assert!(stitch_images(&[], true, true).is_none());
    }
}
