//! The seam between session logic and the stitching engine.

use std::sync::Arc;

use panosweep_stitch::{FrameSequence, StitchConfig, StitchOptions, StitchResult};

/// Anything that turns frames and options into a [`StitchResult`].
///
/// Implementations must be deterministic for the result cache to be
/// sound.
pub trait StitchEngine: Send + Sync {
    fn stitch(&self, frames: &FrameSequence, options: StitchOptions) -> StitchResult;
}

impl<E: StitchEngine + ?Sized> StitchEngine for Arc<E> {
    fn stitch(&self, frames: &FrameSequence, options: StitchOptions) -> StitchResult {
        (**self).stitch(frames, options)
    }
}

impl<E: StitchEngine + ?Sized> StitchEngine for &E {
    fn stitch(&self, frames: &FrameSequence, options: StitchOptions) -> StitchResult {
        (**self).stitch(frames, options)
    }
}

/// The real engine with a fixed config.
#[derive(Debug, Clone, Default)]
pub struct Stitcher {
    config: StitchConfig,
}

impl Stitcher {
    #[must_use]
    pub const fn new(config: StitchConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &StitchConfig {
        &self.config
    }
}

impl StitchEngine for Stitcher {
    fn stitch(&self, frames: &FrameSequence, options: StitchOptions) -> StitchResult {
        panosweep_stitch::stitch_with_config(frames, options, &self.config)
    }
}
