//! Per-option memo of stitch results for one frame set.

use panosweep_stitch::{StitchOptions, StitchResult};

/// One slot per [`StitchOptions`] value, scoped to an epoch.
///
/// Failures are cached alongside successes: stitching is deterministic,
/// so retrying the same frames and options cannot change the outcome.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    cells: [Option<StitchResult>; StitchOptions::COUNT],
    epoch: u64,
}

impl ResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, options: StitchOptions) -> Option<&StitchResult> {
        self.cells[options.index()].as_ref()
    }

    /// Store `result` for `options`, replacing any previous entry.
    pub fn put(&mut self, options: StitchOptions, result: StitchResult) {
        self.cells[options.index()] = Some(result);
    }

    /// Evict every entry and advance the epoch.
    pub fn invalidate_all(&mut self) {
        self.cells = Default::default();
        self.epoch += 1;
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Store `result` only if it was computed against the current epoch.
    ///
    /// Returns `false` (and drops `result`) when `epoch` is stale.
    pub fn put_if_current(
        &mut self,
        epoch: u64,
        options: StitchOptions,
        result: StitchResult,
    ) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.put(options, result);
        true
    }

    /// Number of filled slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use panosweep_stitch::RgbImage;

    fn stitched(value: u8) -> StitchResult {
        StitchResult::Stitched(Arc::new(RgbImage::from_pixel(1, 1, image::Rgb([value; 3]))))
    }

    #[test]
    fn get_returns_latest_put() {
        let mut cache = ResultCache::new();
        let options = StitchOptions::new(true, false);
        assert!(cache.get(options).is_none());
        cache.put(options, stitched(1));
        cache.put(options, stitched(2));
        let image = cache.get(options).unwrap().panorama().unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [2; 3]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn options_have_independent_slots() {
        let mut cache = ResultCache::new();
        for (i, options) in StitchOptions::ALL.into_iter().enumerate() {
            cache.put(options, stitched(u8::try_from(i).unwrap()));
        }
        assert_eq!(cache.len(), StitchOptions::COUNT);
        for (i, options) in StitchOptions::ALL.into_iter().enumerate() {
            let image = cache.get(options).unwrap().panorama().unwrap();
            assert_eq!(usize::from(image.get_pixel(0, 0).0[0]), i);
        }
    }

    #[test]
    fn invalidate_evicts_everything() {
        let mut cache = ResultCache::new();
        cache.put(StitchOptions::default(), stitched(0));
        cache.put(StitchOptions::new(false, false), StitchResult::Failed);
        cache.invalidate_all();
        assert!(cache.is_empty());
        for options in StitchOptions::ALL {
            assert!(cache.get(options).is_none());
        }
    }

    #[test]
    fn failures_are_cached() {
        let mut cache = ResultCache::new();
        cache.put(StitchOptions::default(), StitchResult::Failed);
        assert!(!cache.get(StitchOptions::default()).unwrap().is_stitched());
    }

    #[test]
    fn stale_results_are_dropped() {
        let mut cache = ResultCache::new();
        let epoch = cache.epoch();
        cache.invalidate_all();
        assert!(!cache.put_if_current(epoch, StitchOptions::default(), stitched(0)));
        assert!(cache.is_empty());
        assert!(cache.put_if_current(cache.epoch(), StitchOptions::default(), stitched(0)));
        assert_eq!(cache.len(), 1);
    }
}
