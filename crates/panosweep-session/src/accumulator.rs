//! Ordered, append-only frame storage for one panorama session.

use panosweep_stitch::{Frame, FrameSequence};

/// Frames captured so far, in capture order.
///
/// Staleness is tracked by the result cache epoch that
/// [`Session`](crate::Session) advances alongside every mutation.
#[derive(Debug, Clone, Default)]
pub struct FrameAccumulator {
    frames: Vec<Frame>,
}

impl FrameAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `frame` at the end. No dimension check is made.
    pub fn append(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Drop every frame.
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    /// An immutable copy of the current sequence.
    ///
    /// Only frame handles are copied; pixel data stays shared.
    #[must_use]
    pub fn snapshot(&self) -> FrameSequence {
        FrameSequence::new(self.frames.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
