//! Shared types for the panosweep stitching engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Re-export `RgbImage` so downstream crates can hand frames and
/// panoramas around without depending on `image` directly.
pub use image::RgbImage;

/// Re-export `GrayImage` for masks and registration images.
pub use image::GrayImage;

/// One captured camera frame.
///
/// A cheap clonable handle over a shared 8-bit RGB raster. The pixels are
/// never mutated after construction, so clones can be handed to other
/// threads freely.
#[derive(Debug, Clone)]
pub struct Frame(Arc<RgbImage>);

impl Frame {
    /// Wrap a decoded image.
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self(Arc::new(image))
    }

    /// Borrow the pixels.
    #[must_use]
    pub fn image(&self) -> &RgbImage {
        &self.0
    }

    /// Share the underlying raster without copying it.
    #[must_use]
    pub fn shared(&self) -> Arc<RgbImage> {
        Arc::clone(&self.0)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.0.height()
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.0.width(),
            height: self.0.height(),
        }
    }

    /// Returns `true` if both handles point at the same raster.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        Self::new(image)
    }
}

/// An ordered, immutable list of frames in capture order.
///
/// Produced by snapshotting an accumulator. Cloning shares the frame list,
/// and nothing can append to a sequence once it exists.
#[derive(Debug, Clone, Default)]
pub struct FrameSequence(Arc<[Frame]>);

impl FrameSequence {
    #[must_use]
    pub fn new(frames: Vec<Frame>) -> Self {
        Self(frames.into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.0.iter()
    }
}

impl From<Vec<Frame>> for FrameSequence {
    fn from(frames: Vec<Frame>) -> Self {
        Self::new(frames)
    }
}

impl From<Vec<RgbImage>> for FrameSequence {
    fn from(images: Vec<RgbImage>) -> Self {
        images.into_iter().map(Frame::new).collect()
    }
}

impl FromIterator<Frame> for FrameSequence {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a FrameSequence {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// The two user-facing quality toggles.
///
/// Exactly four combinations exist; [`StitchOptions::index`] maps each to
/// a dense slot in `0..StitchOptions::COUNT` so caches can use a fixed
/// array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StitchOptions {
    /// Straighten the horizon by wave-correcting camera rotations.
    pub wave_correct: bool,
    /// Multi-band (Laplacian pyramid) blending instead of feathering.
    pub multi_band: bool,
}

impl StitchOptions {
    /// Number of distinct option values.
    pub const COUNT: usize = 4;

    /// Every option value, in index order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::new(false, false),
        Self::new(false, true),
        Self::new(true, false),
        Self::new(true, true),
    ];

    #[must_use]
    pub const fn new(wave_correct: bool, multi_band: bool) -> Self {
        Self {
            wave_correct,
            multi_band,
        }
    }

    /// Dense index in `0..COUNT`, the inverse of [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        (self.wave_correct as usize) << 1 | self.multi_band as usize
    }

    /// The same options with wave correction flipped.
    #[must_use]
    pub const fn with_wave_correct_toggled(self) -> Self {
        Self::new(!self.wave_correct, self.multi_band)
    }

    /// The same options with the blender flipped.
    #[must_use]
    pub const fn with_blender_toggled(self) -> Self {
        Self::new(self.wave_correct, !self.multi_band)
    }
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// Outcome of one stitch: a panorama, or an explicit failure marker.
///
/// No partial image is ever produced on failure.
#[derive(Debug, Clone)]
pub enum StitchResult {
    Stitched(Arc<RgbImage>),
    Failed,
}

impl StitchResult {
    #[must_use]
    pub const fn is_stitched(&self) -> bool {
        matches!(self, Self::Stitched(_))
    }

    #[must_use]
    pub fn panorama(&self) -> Option<&RgbImage> {
        match self {
            Self::Stitched(image) => Some(image),
            Self::Failed => None,
        }
    }
}

impl From<Result<RgbImage, StitchError>> for StitchResult {
    fn from(result: Result<RgbImage, StitchError>) -> Self {
        result.map_or(Self::Failed, |image| Self::Stitched(Arc::new(image)))
    }
}

/// Projection surface the frames are warped onto before blending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarpSurface {
    /// Longitude/latitude mapping. Handles wide horizontal sweeps.
    #[default]
    Spherical,
    /// Cylinder around the vertical axis.
    Cylindrical,
    /// Rectilinear plane tangent at the reference camera. Only sensible for
    /// narrow fields of view.
    Plane,
}

impl std::fmt::Display for WarpSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spherical => write!(f, "spherical"),
            Self::Cylindrical => write!(f, "cylindrical"),
            Self::Plane => write!(f, "plane"),
        }
    }
}

/// Tunables for the stitching engine.
///
/// Defaults suit hand-held sweeps at phone-camera preview resolutions.
/// Use [`StitchConfig::validate`] before running when values come from an
/// untrusted source such as a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Registration resolution in megapixels. Frames larger than this are
    /// downscaled for feature extraction and matching.
    pub work_megapix: f64,

    /// Maximum keypoints kept per frame (strongest first).
    pub max_features: usize,

    /// FAST-9 intensity threshold.
    pub fast_threshold: u8,

    /// Number of pyramid levels searched for keypoints.
    pub pyramid_levels: usize,

    /// Frames with fewer keypoints than this do not count as usable.
    pub min_features: usize,

    /// Match each frame against the next `n` frames in capture order.
    /// `None` matches every pair.
    pub match_window: Option<usize>,

    /// Lowe ratio: best distance must be below `ratio * second best`.
    pub match_ratio: f32,

    /// RANSAC inlier threshold in registration pixels.
    pub ransac_threshold: f64,

    /// Upper bound on RANSAC iterations per pair.
    pub ransac_iterations: usize,

    /// Seed for RANSAC sampling. Combined with the pair indices so every
    /// pair draws a reproducible sample stream.
    pub ransac_seed: u64,

    /// Minimum RANSAC inliers for a pair to be accepted.
    pub min_inliers: usize,

    /// Pair acceptance threshold on `inliers / (8 + 0.3 * matches)`.
    pub match_confidence: f64,

    /// Accepted pairs whose mean inlier motion (registration pixels) is at
    /// most this show the same view; such frames are merged into one.
    pub duplicate_motion: f64,

    /// Largest acceptable RMS ray residual (in pixels at the estimated
    /// focal length) when the bundle adjustment does not report success.
    pub max_reprojection_rms: f64,

    /// Patience factor for Levenberg-Marquardt; bounds the evaluations.
    pub max_refine_evaluations: usize,

    /// Projection surface.
    pub surface: WarpSurface,

    /// Whether to equalize per-frame gains before blending.
    pub exposure_compensation: bool,

    /// Multi-band blend width as a percentage of the canvas diagonal scale.
    pub blend_strength: f32,

    /// Feather weight slope per pixel of distance to the mask border.
    pub feather_sharpness: f32,

    /// Largest canvas the compositor will allocate.
    pub max_output_pixels: u64,
}

impl StitchConfig {
    pub const DEFAULT_WORK_MEGAPIX: f64 = 0.6;
    pub const DEFAULT_MAX_FEATURES: usize = 500;
    pub const DEFAULT_FAST_THRESHOLD: u8 = 20;
    pub const DEFAULT_PYRAMID_LEVELS: usize = 3;
    pub const DEFAULT_MIN_FEATURES: usize = 16;
    pub const DEFAULT_MATCH_WINDOW: Option<usize> = Some(4);
    pub const DEFAULT_MATCH_RATIO: f32 = 0.8;
    pub const DEFAULT_RANSAC_THRESHOLD: f64 = 3.0;
    pub const DEFAULT_RANSAC_ITERATIONS: usize = 500;
    pub const DEFAULT_RANSAC_SEED: u64 = 0x5EED_CAFE;
    pub const DEFAULT_MIN_INLIERS: usize = 12;
    pub const DEFAULT_MATCH_CONFIDENCE: f64 = 1.0;
    pub const DEFAULT_DUPLICATE_MOTION: f64 = 1.5;
    pub const DEFAULT_MAX_REPROJECTION_RMS: f64 = 8.0;
    pub const DEFAULT_MAX_REFINE_EVALUATIONS: usize = 100;
    pub const DEFAULT_EXPOSURE_COMPENSATION: bool = true;
    pub const DEFAULT_BLEND_STRENGTH: f32 = 5.0;
    pub const DEFAULT_FEATHER_SHARPNESS: f32 = 0.02;
    pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = 64_000_000;

    /// Check every field for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::InvalidConfig`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), StitchError> {
        let fail = |msg: &str| Err(StitchError::InvalidConfig(msg.to_owned()));

        if !(self.work_megapix.is_finite() && self.work_megapix > 0.0) {
            return fail("work_megapix must be positive");
        }
        if self.max_features == 0 {
            return fail("max_features must be at least 1");
        }
        if self.pyramid_levels == 0 {
            return fail("pyramid_levels must be at least 1");
        }
        if self.match_window == Some(0) {
            return fail("match_window must be at least 1 when set");
        }
        if !(self.match_ratio > 0.0 && self.match_ratio <= 1.0) {
            return fail("match_ratio must be in (0, 1]");
        }
        if !(self.ransac_threshold.is_finite() && self.ransac_threshold > 0.0) {
            return fail("ransac_threshold must be positive");
        }
        if self.ransac_iterations == 0 {
            return fail("ransac_iterations must be at least 1");
        }
        if self.min_inliers < 4 {
            return fail("min_inliers must be at least 4");
        }
        if !(self.match_confidence.is_finite() && self.match_confidence >= 0.0) {
            return fail("match_confidence must be non-negative");
        }
        if !(self.duplicate_motion.is_finite() && self.duplicate_motion >= 0.0) {
            return fail("duplicate_motion must be non-negative");
        }
        if !(self.max_reprojection_rms.is_finite() && self.max_reprojection_rms > 0.0) {
            return fail("max_reprojection_rms must be positive");
        }
        if self.max_refine_evaluations == 0 {
            return fail("max_refine_evaluations must be at least 1");
        }
        if !(self.blend_strength.is_finite() && self.blend_strength >= 0.0) {
            return fail("blend_strength must be non-negative");
        }
        if !(self.feather_sharpness.is_finite() && self.feather_sharpness > 0.0) {
            return fail("feather_sharpness must be positive");
        }
        if self.max_output_pixels == 0 {
            return fail("max_output_pixels must be at least 1");
        }
        Ok(())
    }
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            work_megapix: Self::DEFAULT_WORK_MEGAPIX,
            max_features: Self::DEFAULT_MAX_FEATURES,
            fast_threshold: Self::DEFAULT_FAST_THRESHOLD,
            pyramid_levels: Self::DEFAULT_PYRAMID_LEVELS,
            min_features: Self::DEFAULT_MIN_FEATURES,
            match_window: Self::DEFAULT_MATCH_WINDOW,
            match_ratio: Self::DEFAULT_MATCH_RATIO,
            ransac_threshold: Self::DEFAULT_RANSAC_THRESHOLD,
            ransac_iterations: Self::DEFAULT_RANSAC_ITERATIONS,
            ransac_seed: Self::DEFAULT_RANSAC_SEED,
            min_inliers: Self::DEFAULT_MIN_INLIERS,
            match_confidence: Self::DEFAULT_MATCH_CONFIDENCE,
            duplicate_motion: Self::DEFAULT_DUPLICATE_MOTION,
            max_reprojection_rms: Self::DEFAULT_MAX_REPROJECTION_RMS,
            max_refine_evaluations: Self::DEFAULT_MAX_REFINE_EVALUATIONS,
            surface: WarpSurface::default(),
            exposure_compensation: Self::DEFAULT_EXPOSURE_COMPENSATION,
            blend_strength: Self::DEFAULT_BLEND_STRENGTH,
            feather_sharpness: Self::DEFAULT_FEATHER_SHARPNESS,
            max_output_pixels: Self::DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

/// Reasons a stitch can fail.
///
/// All variants are expected outcomes of bad input (too little overlap,
/// too few frames), never bugs. The `stitch` boundary collapses them into
/// [`StitchResult::Failed`] after logging.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum StitchError {
    /// Not enough frames carry enough features to register.
    #[error("need at least {required} usable frames, got {usable}")]
    InputTooSmall { usable: usize, required: usize },

    /// The match graph splits into several components.
    #[error("frames do not overlap enough: match graph has {components} components")]
    InsufficientOverlap { components: usize },

    /// Camera parameter estimation did not converge.
    #[error("camera estimation failed: {reason}")]
    ConvergenceFailure { reason: String },

    /// The composited raster is empty or too large to allocate.
    #[error("degenerate output raster {width}x{height}")]
    DegenerateOutput { width: u64, height: u64 },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StitchError {
    /// Short machine-friendly name of the variant, for logs and reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InputTooSmall { .. } => "input_too_small",
            Self::InsufficientOverlap { .. } => "insufficient_overlap",
            Self::ConvergenceFailure { .. } => "convergence_failure",
            Self::DegenerateOutput { .. } => "degenerate_output",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}
