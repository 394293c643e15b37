//! Shared session state: the frame accumulator and its result cache.

use std::sync::Arc;

use panosweep_stitch::{Frame, FrameSequence, StitchOptions, StitchResult};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::accumulator::FrameAccumulator;
use crate::cache::ResultCache;

#[derive(Debug, Default)]
struct State {
    frames: FrameAccumulator,
    cache: ResultCache,
}

/// A frame set tagged with the cache epoch it was taken at.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frames: FrameSequence,
    pub epoch: u64,
}

/// Cheaply clonable handle to one panorama session.
///
/// The accumulator and cache sit behind a single lock. Mutations
/// invalidate the cache inside the same write section, so no reader can
/// see new frames next to results computed from the old ones.
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: Arc<RwLock<State>>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and invalidate cached results. Returns the new length.
    pub fn append(&self, frame: Frame) -> usize {
        let mut state = self.state.write();
        state.frames.append(frame);
        state.cache.invalidate_all();
        let len = state.frames.len();
        drop(state);
        info!(frames = len, "captured frame");
        len
    }

    /// Drop all frames and cached results.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.frames.reset();
        state.cache.invalidate_all();
        drop(state);
        debug!("session reset");
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        Snapshot {
            frames: state.frames.snapshot(),
            epoch: state.cache.epoch(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().frames.is_empty()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.read().cache.epoch()
    }

    /// Cached result for `options`, if one exists for the current frames.
    #[must_use]
    pub fn cached(&self, options: StitchOptions) -> Option<StitchResult> {
        self.state.read().cache.get(options).cloned()
    }

    /// Number of option values with a cached result.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.state.read().cache.len()
    }

    /// Cache `result` if the frames have not changed since `epoch`.
    pub fn store(&self, epoch: u64, options: StitchOptions, result: StitchResult) -> bool {
        let stored = self
            .state
            .write()
            .cache
            .put_if_current(epoch, options, result);
        if !stored {
            debug!(epoch, ?options, "dropping stale stitch result");
        }
        stored
    }
}
