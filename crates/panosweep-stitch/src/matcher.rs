//! Pairwise descriptor matching.
//!
//! Brute-force Hamming matching between two frames' descriptors, filtered
//! by Lowe's ratio test and a mutual-nearest-neighbour cross-check. Which
//! frame pairs get matched at all is decided by [`candidate_pairs`].

use crate::features::Descriptor;

/// One putative correspondence between two descriptor sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    /// Index into the query set.
    pub query: usize,
    /// Index into the train set.
    pub train: usize,
    /// Hamming distance.
    pub distance: u32,
}

/// Frame index pairs `(i, j)` with `i < j` to attempt matching on.
///
/// With `Some(window)` each frame is paired with the next `window` frames
/// in capture order; with `None` every pair is attempted.
#[must_use]
pub fn candidate_pairs(count: usize, window: Option<usize>) -> Vec<(usize, usize)> {
    let reach = window.unwrap_or(count);
    (0..count)
        .flat_map(|i| {
            let end = count.min(i.saturating_add(reach).saturating_add(1));
            ((i + 1)..end).map(move |j| (i, j))
        })
        .collect()
}

/// Match `query` against `train`, keeping ratio-test survivors that are
/// also each other's nearest neighbour.
///
/// A query whose train set has a single descriptor skips the ratio test.
#[must_use = "returns the filtered matches"]
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    ratio: f32,
) -> Vec<DescriptorMatch> {
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }

    let reverse: Vec<Option<usize>> = train
        .iter()
        .map(|t| nearest(t, query).map(|(idx, _, _)| idx))
        .collect();

    query
        .iter()
        .enumerate()
        .filter_map(|(query_idx, q)| {
            let (train_idx, best, second) = nearest(q, train)?;
            if let Some(second) = second {
                #[allow(clippy::cast_precision_loss)]
                let passes = (best as f32) < ratio * second as f32;
                if !passes {
                    return None;
                }
            }
            (reverse[train_idx] == Some(query_idx)).then_some(DescriptorMatch {
                query: query_idx,
                train: train_idx,
                distance: best,
            })
        })
        .collect()
}

/// Nearest neighbour of `needle` in `haystack`: `(index, best, second best)`.
///
/// Ties keep the lowest index.
fn nearest(needle: &Descriptor, haystack: &[Descriptor]) -> Option<(usize, u32, Option<u32>)> {
    let mut best: Option<(usize, u32)> = None;
    let mut second: Option<u32> = None;
    for (idx, candidate) in haystack.iter().enumerate() {
        let d = needle.hamming(candidate);
        match best {
            Some((_, best_d)) if d >= best_d => {
                if second.is_none_or(|s| d < s) {
                    second = Some(d);
                }
            }
            Some((_, best_d)) => {
                second = Some(best_d);
                best = Some((idx, d));
            }
            None => best = Some((idx, d)),
        }
    }
    best.map(|(idx, d)| (idx, d, second))
}
