//! Incremental stitching: advance stage by stage, inspecting each
//! intermediate result before continuing.
//!
//! [`crate::try_stitch`] runs every stage in one call. [`Pipeline`] lets
//! the caller drive execution one step at a time:
//!
//! ```rust
//! # use panosweep_stitch::{FrameSequence, Pipeline, StitchConfig, StitchError, StitchOptions};
//! # fn run(frames: FrameSequence) -> Result<(), StitchError> {
//! let panorama = Pipeline::new(frames, StitchOptions::default(), StitchConfig::default())
//!     .detect_features()?
//!     .match_pairs()?
//!     .estimate_cameras()?
//!     .straighten()
//!     .warp()?
//!     .compensate_exposure()
//!     .find_seams()
//!     .blend()?
//!     .into_panorama();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state (or a
//! `Result` for fallible stages). Registration data (features, pairs) is
//! dropped once cameras are estimated; warped frames are dropped once
//! blended.

use image::GrayImage;
use rayon::prelude::*;
use tracing::debug;

use crate::blend::{self, Blender, BlenderKind};
use crate::camera::{self, CameraParams};
use crate::diagnostics::StageMetrics;
use crate::features::{self, FeatureParams, FrameFeatures};
use crate::graph::{self, MatchGraph};
use crate::pairs::{self, PairMatch};
use crate::refine;
use crate::scale;
use crate::types::{Dimensions, FrameSequence, RgbImage, StitchConfig, StitchError, StitchOptions};
use crate::warp::{self, Rect, WarpedFrame};
use crate::wave;

/// Inputs every stage carries along.
#[derive(Debug, Clone)]
struct Context {
    frames: FrameSequence,
    options: StitchOptions,
    config: StitchConfig,
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
#[must_use = "pipeline stages are consumed by advancing; call .detect_features() to continue"]
pub struct Pending {
    ctx: Context,
}

impl Pending {
    #[must_use]
    pub fn frames(&self) -> &FrameSequence {
        &self.ctx.frames
    }

    /// Reduce every frame to registration resolution and extract features.
    ///
    /// All frames share one scale, chosen so the largest frame fits
    /// `config.work_megapix`.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::InputTooSmall`] if fewer than two frames have
    /// at least `config.min_features` keypoints.
    pub fn detect_features(self) -> Result<FeaturesDetected, StitchError> {
        let config = &self.ctx.config;
        let work_scale = self
            .ctx
            .frames
            .iter()
            .map(|f| scale::work_scale(f.dimensions(), config.work_megapix))
            .fold(1.0, f64::min);
        let params = FeatureParams {
            max_features: config.max_features,
            fast_threshold: config.fast_threshold,
            levels: config.pyramid_levels,
        };

        let features: Vec<FrameFeatures> = self
            .ctx
            .frames
            .frames()
            .par_iter()
            .map(|frame| {
                let gray = scale::registration_image(frame.image(), work_scale);
                features::extract(&gray, params)
            })
            .collect();

        let usable = features
            .iter()
            .filter(|f| f.len() >= config.min_features)
            .count();
        debug!(
            frames = features.len(),
            usable,
            work_scale,
            keypoints = ?features.iter().map(FrameFeatures::len).collect::<Vec<_>>(),
            "features detected"
        );
        if usable < 2 {
            return Err(StitchError::InputTooSmall {
                usable,
                required: 2,
            });
        }

        Ok(FeaturesDetected {
            ctx: self.ctx,
            work_scale,
            features,
        })
    }
}

// ───────────────────────── Stage 1: FeaturesDetected ─────────────────

/// Pipeline state after feature extraction.
#[must_use = "pipeline stages are consumed by advancing; call .match_pairs() to continue"]
pub struct FeaturesDetected {
    ctx: Context,
    work_scale: f64,
    features: Vec<FrameFeatures>,
}

impl FeaturesDetected {
    #[must_use]
    pub fn features(&self) -> &[FrameFeatures] {
        &self.features
    }

    /// Registration scale relative to the input frames.
    #[must_use]
    pub const fn work_scale(&self) -> f64 {
        self.work_scale
    }

    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let counts = self.features.iter().map(FrameFeatures::len);
        StageMetrics::Features {
            frame_count: self.features.len(),
            work_scale: self.work_scale,
            total_keypoints: counts.clone().sum(),
            min_keypoints: counts.min().unwrap_or(0),
            usable_frames: self
                .features
                .iter()
                .filter(|f| f.len() >= self.ctx.config.min_features)
                .count(),
        }
    }

    /// Register every candidate pair, merge frames showing the same view,
    /// and assemble the match graph.
    ///
    /// Later stages only see the surviving frames.
    ///
    /// # Errors
    ///
    /// - [`StitchError::InputTooSmall`] if fewer than two distinct views
    ///   remain after merging.
    /// - [`StitchError::InsufficientOverlap`] if the accepted pairs do not
    ///   connect all frames.
    pub fn match_pairs(self) -> Result<PairsMatched, StitchError> {
        let frame_count = self.features.len();
        let config = &self.ctx.config;
        let candidates = crate::matcher::candidate_pairs(frame_count, config.match_window);
        let accepted: Vec<PairMatch> = candidates
            .par_iter()
            .filter_map(|&(i, j)| {
                pairs::register_pair(i, j, &self.features[i], &self.features[j], config)
            })
            .collect();
        let accepted_count = accepted.len();

        let collapsed = graph::collapse_duplicates(frame_count, accepted, config.duplicate_motion);
        let duplicates = collapsed.duplicates(frame_count);
        if collapsed.kept.len() < 2 {
            debug!(frame_count, duplicates, "sweep shows a single view");
            return Err(StitchError::InputTooSmall {
                usable: collapsed.kept.len(),
                required: 2,
            });
        }

        let (ctx, features) = if duplicates == 0 {
            (self.ctx, self.features)
        } else {
            retain_frames(self.ctx, self.features, &collapsed.kept)
        };

        let graph = MatchGraph::new(features.len(), &collapsed.pairs);
        let components = graph.component_count();
        debug!(
            candidates = candidates.len(),
            accepted = accepted_count,
            duplicates,
            components,
            "pairs matched"
        );
        if components > 1 {
            return Err(StitchError::InsufficientOverlap { components });
        }

        Ok(PairsMatched {
            ctx,
            work_scale: self.work_scale,
            features,
            candidates: candidates.len(),
            duplicates,
            pairs: collapsed.pairs,
            graph,
        })
    }
}

/// Keep only the frames (and their features) at the ascending indices in
/// `kept`.
fn retain_frames(
    ctx: Context,
    features: Vec<FrameFeatures>,
    kept: &[usize],
) -> (Context, Vec<FrameFeatures>) {
    let keep = |i: &usize| kept.binary_search(i).is_ok();
    let frames = ctx
        .frames
        .iter()
        .enumerate()
        .filter(|(i, _)| keep(i))
        .map(|(_, frame)| frame.clone())
        .collect();
    let features = features
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep(i))
        .map(|(_, f)| f)
        .collect();
    (
        Context {
            frames: FrameSequence::new(frames),
            ..ctx
        },
        features,
    )
}

// ───────────────────────── Stage 2: PairsMatched ─────────────────────

/// Pipeline state after pairwise registration. The match graph is
/// connected.
#[must_use = "pipeline stages are consumed by advancing; call .estimate_cameras() to continue"]
pub struct PairsMatched {
    ctx: Context,
    work_scale: f64,
    features: Vec<FrameFeatures>,
    candidates: usize,
    duplicates: usize,
    pairs: Vec<PairMatch>,
    graph: MatchGraph,
}

impl PairsMatched {
    /// Frames that survived duplicate merging, in capture order.
    #[must_use]
    pub fn frames(&self) -> &FrameSequence {
        &self.ctx.frames
    }

    /// Input frames merged into an earlier one.
    #[must_use]
    pub const fn duplicates(&self) -> usize {
        self.duplicates
    }

    #[must_use]
    pub fn pairs(&self) -> &[PairMatch] {
        &self.pairs
    }

    #[must_use]
    pub const fn graph(&self) -> &MatchGraph {
        &self.graph
    }

    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        #[allow(clippy::cast_precision_loss)]
        let mean_confidence = if self.pairs.is_empty() {
            0.0
        } else {
            self.pairs.iter().map(|p| p.confidence).sum::<f64>() / self.pairs.len() as f64
        };
        StageMetrics::Matching {
            candidate_pairs: self.candidates,
            accepted_pairs: self.pairs.len(),
            duplicate_frames: self.duplicates,
            mean_confidence,
            components: self.graph.component_count(),
        }
    }

    /// Estimate focal lengths, chain rotations down the spanning tree and
    /// refine everything jointly. Cameras come out in full-resolution
    /// pixels.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::ConvergenceFailure`] if refinement fails.
    pub fn estimate_cameras(self) -> Result<CamerasEstimated, StitchError> {
        let dims: Vec<Dimensions> = self
            .features
            .iter()
            .zip(self.ctx.frames.iter())
            .map(|(f, frame)| f.dimensions.unwrap_or_else(|| frame.dimensions()))
            .collect();
        let focal = camera::estimate_focal(&self.pairs, &dims);
        let tree = self.graph.spanning_tree(&self.pairs);
        let initial = camera::initial_cameras(dims.len(), &self.pairs, &tree, focal);

        let refinement = refine::refine(
            &initial,
            &self.pairs,
            tree.center,
            self.ctx.config.max_reprojection_rms,
            self.ctx.config.max_refine_evaluations,
        )?;
        debug!(
            focal,
            center = tree.center,
            rms = refinement.rms,
            evaluations = refinement.evaluations,
            "cameras estimated"
        );

        let cameras = refinement
            .cameras
            .iter()
            .map(|c| CameraParams {
                focal: c.focal / self.work_scale,
                rotation: c.rotation,
            })
            .collect();

        Ok(CamerasEstimated {
            ctx: self.ctx,
            cameras,
            center: tree.center,
            initial_focal: focal / self.work_scale,
            rms: refinement.rms,
            evaluations: refinement.evaluations,
            converged: refinement.converged,
        })
    }
}

// ───────────────────────── Stage 3: CamerasEstimated ─────────────────

/// Pipeline state after camera estimation.
#[must_use = "pipeline stages are consumed by advancing; call .straighten() to continue"]
pub struct CamerasEstimated {
    ctx: Context,
    cameras: Vec<CameraParams>,
    center: usize,
    initial_focal: f64,
    rms: f64,
    evaluations: usize,
    converged: bool,
}

impl CamerasEstimated {
    /// Refined cameras in full-resolution pixels; the reference is the
    /// identity.
    #[must_use]
    pub fn cameras(&self) -> &[CameraParams] {
        &self.cameras
    }

    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Cameras {
            initial_focal: self.initial_focal,
            median_focal: median_focal(&self.cameras),
            center: self.center,
            rms: self.rms,
            evaluations: self.evaluations,
            converged: self.converged,
        }
    }

    /// Apply wave correction when `options.wave_correct` is set.
    pub fn straighten(self) -> Straightened {
        let mut cameras = self.cameras;
        let corrected = self.ctx.options.wave_correct;
        if corrected {
            wave::wave_correct(&mut cameras);
        }
        Straightened {
            ctx: self.ctx,
            cameras,
            corrected,
        }
    }
}

// ───────────────────────── Stage 4: Straightened ─────────────────────

/// Pipeline state after optional wave correction.
#[must_use = "pipeline stages are consumed by advancing; call .warp() to continue"]
pub struct Straightened {
    ctx: Context,
    cameras: Vec<CameraParams>,
    corrected: bool,
}

impl Straightened {
    #[must_use]
    pub fn cameras(&self) -> &[CameraParams] {
        &self.cameras
    }

    /// `None` when wave correction was not requested.
    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        self.corrected.then(|| StageMetrics::WaveCorrection {
            camera_count: self.cameras.len(),
        })
    }

    /// Project every frame onto the configured surface at the median focal
    /// length.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::DegenerateOutput`] if a frame does not
    /// project, or the canvas would exceed `config.max_output_pixels`.
    pub fn warp(self) -> Result<Warped, StitchError> {
        let scale = median_focal(&self.cameras);
        let surface = self.ctx.config.surface;
        let max_pixels = self.ctx.config.max_output_pixels;

        let frames: Vec<WarpedFrame> = self
            .ctx
            .frames
            .frames()
            .par_iter()
            .zip(self.cameras.par_iter())
            .map(|(frame, &camera)| {
                warp::warp_frame(frame.image(), camera, surface, scale, max_pixels)
            })
            .collect::<Result<_, _>>()?;

        let canvas = warp::canvas_rect(&frames).ok_or(StitchError::DegenerateOutput {
            width: 0,
            height: 0,
        })?;
        if canvas.area() > max_pixels {
            return Err(StitchError::DegenerateOutput {
                width: u64::from(canvas.width),
                height: u64::from(canvas.height),
            });
        }
        debug!(%surface, scale, ?canvas, "frames warped");

        Ok(Warped {
            ctx: self.ctx,
            frames,
            canvas,
            scale,
        })
    }
}

// ───────────────────────── Stage 5: Warped ───────────────────────────

/// Pipeline state after projection onto the surface.
#[must_use = "pipeline stages are consumed by advancing; call .compensate_exposure() to continue"]
pub struct Warped {
    ctx: Context,
    frames: Vec<WarpedFrame>,
    canvas: Rect,
    scale: f64,
}

impl Warped {
    #[must_use]
    pub fn warped(&self) -> &[WarpedFrame] {
        &self.frames
    }

    #[must_use]
    pub const fn canvas(&self) -> Rect {
        self.canvas
    }

    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Warp {
            surface: self.ctx.config.surface.to_string(),
            scale: self.scale,
            canvas_width: self.canvas.width,
            canvas_height: self.canvas.height,
        }
    }

    /// Equalize per-frame gains when `config.exposure_compensation` is
    /// set.
    pub fn compensate_exposure(self) -> Compensated {
        let mut frames = self.frames;
        let gains = self
            .ctx
            .config
            .exposure_compensation
            .then(|| crate::exposure::compensate(&mut frames));
        debug!(?gains, "exposure compensated");
        Compensated {
            ctx: self.ctx,
            frames,
            canvas: self.canvas,
            gains,
        }
    }
}

// ───────────────────────── Stage 6: Compensated ──────────────────────

/// Pipeline state after optional exposure compensation.
#[must_use = "pipeline stages are consumed by advancing; call .find_seams() to continue"]
pub struct Compensated {
    ctx: Context,
    frames: Vec<WarpedFrame>,
    canvas: Rect,
    gains: Option<Vec<f64>>,
}

impl Compensated {
    /// Per-frame gains, `None` when compensation is disabled.
    #[must_use]
    pub fn gains(&self) -> Option<&[f64]> {
        self.gains.as_deref()
    }

    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        self.gains.as_ref().map(|gains| StageMetrics::Exposure {
            min_gain: gains.iter().copied().fold(f64::INFINITY, f64::min),
            max_gain: gains.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    /// Decide which frame owns each overlap pixel.
    pub fn find_seams(self) -> SeamsFound {
        let seams = crate::seam::find_seams(&self.frames);
        SeamsFound {
            ctx: self.ctx,
            frames: self.frames,
            canvas: self.canvas,
            seams,
        }
    }
}

// ───────────────────────── Stage 7: SeamsFound ───────────────────────

/// Pipeline state after seam estimation.
#[must_use = "pipeline stages are consumed by advancing; call .blend() to continue"]
pub struct SeamsFound {
    ctx: Context,
    frames: Vec<WarpedFrame>,
    canvas: Rect,
    seams: Vec<GrayImage>,
}

impl SeamsFound {
    /// Ownership mask per frame.
    #[must_use]
    pub fn seams(&self) -> &[GrayImage] {
        &self.seams
    }

    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let owned = |m: &GrayImage| m.pixels().filter(|p| p.0[0] > 0).count() as u64;
        let valid: u64 = self.frames.iter().map(|f| owned(&f.mask)).sum();
        let kept: u64 = self.seams.iter().map(owned).sum();
        StageMetrics::Seams {
            valid_pixels: valid,
            owned_pixels: kept,
        }
    }

    /// Blend with the blender the options select, then crop to coverage.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::DegenerateOutput`] if nothing is covered.
    pub fn blend(self) -> Result<Blended, StitchError> {
        let blender =
            BlenderKind::for_options(self.ctx.options.multi_band, self.canvas, &self.ctx.config);
        let composite = blender.blend(&self.frames, &self.seams, self.canvas);
        let panorama = blend::crop_to_coverage(&composite)?;
        debug!(
            blender = blender.name(),
            width = panorama.width(),
            height = panorama.height(),
            "blended"
        );
        Ok(Blended {
            blender,
            panorama,
        })
    }
}

// ───────────────────────── Stage 8: Blended ──────────────────────────

/// Final stage: the cropped panorama.
#[must_use = "call .into_panorama() to extract the image"]
pub struct Blended {
    blender: BlenderKind,
    panorama: RgbImage,
}

impl Blended {
    #[must_use]
    pub const fn panorama(&self) -> &RgbImage {
        &self.panorama
    }

    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Blend {
            strategy: self.blender.name().to_owned(),
            bands: match self.blender {
                BlenderKind::MultiBand(b) => b.bands,
                BlenderKind::Feather(_) => 0,
            },
            width: self.panorama.width(),
            height: self.panorama.height(),
        }
    }

    #[must_use]
    pub fn into_panorama(self) -> RgbImage {
        self.panorama
    }
}

/// Entry point for the staged pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Store the inputs; no processing happens until
    /// [`.detect_features()`](Pending::detect_features).
    #[allow(clippy::new_ret_no_self)]
    pub const fn new(
        frames: FrameSequence,
        options: StitchOptions,
        config: StitchConfig,
    ) -> Pending {
        Pending {
            ctx: Context {
                frames,
                options,
                config,
            },
        }
    }
}

fn median_focal(cameras: &[CameraParams]) -> f64 {
    let mut focals: Vec<f64> = cameras.iter().map(|c| c.focal).collect();
    focals.sort_by(f64::total_cmp);
    match focals.len() {
        0 => 1.0,
        n if n % 2 == 1 => focals[n / 2],
        n => f64::midpoint(focals[n / 2 - 1], focals[n / 2]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::synthetic::{Scene, SweepSpec};

    fn sweep(frames: usize) -> FrameSequence {
        SweepSpec::default().with_frames(frames).render(&Scene::new(7))
    }

    #[test]
    fn stages_advance_to_a_panorama() {
        let frames = sweep(3);
        let (w, h) = (frames.frames()[0].width(), frames.frames()[0].height());
        let detected = Pipeline::new(frames, StitchOptions::default(), StitchConfig::default())
            .detect_features()
            .unwrap();
        assert_eq!(detected.features().len(), 3);

        let matched = detected.match_pairs().unwrap();
        assert!(matched.pairs().len() >= 2);
        assert!(matched.graph().is_connected());

        let cameras = matched.estimate_cameras().unwrap();
        assert_eq!(cameras.cameras().len(), 3);

        let straightened = cameras.straighten();
        assert!(straightened.metrics().is_some());

        let panorama = straightened
            .warp()
            .unwrap()
            .compensate_exposure()
            .find_seams()
            .blend()
            .unwrap()
            .into_panorama();
        assert!(panorama.width() > w || panorama.height() > h);
    }

    #[test]
    fn blank_frames_are_too_small() {
        let blank = RgbImage::from_pixel(80, 60, image::Rgb([128, 128, 128]));
        let frames = FrameSequence::from(vec![blank.clone(), blank]);
        let result = Pipeline::new(frames, StitchOptions::default(), StitchConfig::default())
            .detect_features();
        assert!(matches!(
            result,
            Err(StitchError::InputTooSmall {
                usable: 0,
                required: 2
            })
        ));
    }

    #[test]
    fn identical_frames_are_one_view() {
        let still = sweep(1).frames()[0].image().clone();
        let frames = FrameSequence::from(vec![still.clone(), still.clone(), still]);
        let detected = Pipeline::new(frames, StitchOptions::default(), StitchConfig::default())
            .detect_features()
            .unwrap();
        assert!(matches!(
            detected.match_pairs(),
            Err(StitchError::InputTooSmall {
                usable: 1,
                required: 2
            })
        ));
    }

    #[test]
    fn unrelated_scenes_do_not_connect() {
        let spec = SweepSpec::default().with_frames(1);
        let mut frames: Vec<_> = spec.render(&Scene::new(1)).iter().cloned().collect();
        frames.extend(spec.render(&Scene::new(2)).iter().cloned());
        let result = Pipeline::new(frames.into(), StitchOptions::default(), StitchConfig::default())
            .detect_features()
            .unwrap()
            .match_pairs();
        assert!(matches!(
            result,
            Err(StitchError::InsufficientOverlap { components: 2 })
        ));
    }

    #[test]
    fn median_focal_of_even_count_averages() {
        let cams: Vec<CameraParams> = [100.0, 300.0, 200.0, 400.0]
            .iter()
            .map(|&focal| CameraParams {
                focal,
                rotation: nalgebra::Matrix3::identity(),
            })
            .collect();
        assert!((median_focal(&cams) - 250.0).abs() < 1e-12);
    }
}
