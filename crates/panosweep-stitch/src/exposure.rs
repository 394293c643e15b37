//! Gain-based exposure compensation.
//!
//! Each frame gets one scalar gain. Gains minimize the squared intensity
//! difference over every pairwise overlap, with a prior pulling each gain
//! towards 1 so the trivial all-zero solution is excluded:
//!
//! `e = Σ N_ij * ((g_i I_ij - g_j I_ji)² / σ_N² + (1 - g_i)² / σ_g²)`
//!
//! where `N_ij` is the overlap size and `I_ij` the mean intensity of frame
//! `i` inside its overlap with frame `j`.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::warp::WarpedFrame;

/// `1 / σ_N²` with intensities in `0..=255`.
const ALPHA: f64 = 0.01;
/// `1 / σ_g²`.
const BETA: f64 = 100.0;

#[derive(Debug, Clone, Copy, Default)]
struct Overlap {
    count: f64,
    /// Mean intensity of the first frame inside the overlap.
    mean_a: f64,
    /// Mean intensity of the second frame inside the overlap.
    mean_b: f64,
}

#[allow(clippy::cast_sign_loss)]
fn overlap(a: &WarpedFrame, b: &WarpedFrame) -> Overlap {
    let Some(region) = a.rect().intersect(&b.rect()) else {
        return Overlap::default();
    };
    let mut count = 0u64;
    let mut sum_a = 0u64;
    let mut sum_b = 0u64;
    for v in region.y..region.bottom() {
        for u in region.x..region.right() {
            let (ax, ay) = ((u - a.corner.0) as u32, (v - a.corner.1) as u32);
            let (bx, by) = ((u - b.corner.0) as u32, (v - b.corner.1) as u32);
            if a.mask.get_pixel(ax, ay).0[0] == 0 || b.mask.get_pixel(bx, by).0[0] == 0 {
                continue;
            }
            count += 1;
            sum_a += a.image.get_pixel(ax, ay).0.iter().map(|&c| u64::from(c)).sum::<u64>();
            sum_b += b.image.get_pixel(bx, by).0.iter().map(|&c| u64::from(c)).sum::<u64>();
        }
    }
    if count == 0 {
        return Overlap::default();
    }
    #[allow(clippy::cast_precision_loss)]
    let (n, sa, sb) = (count as f64, sum_a as f64, sum_b as f64);
    Overlap {
        count: n,
        mean_a: sa / (3.0 * n),
        mean_b: sb / (3.0 * n),
    }
}

fn valid_count(frame: &WarpedFrame) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = frame.mask.pixels().filter(|p| p.0[0] > 0).count() as f64;
    n
}

/// Per-frame gains. Falls back to all ones if the system is singular.
#[must_use]
pub fn estimate_gains(frames: &[WarpedFrame]) -> Vec<f64> {
    let n = frames.len();
    if n < 2 {
        return vec![1.0; n];
    }

    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect();
    let overlaps: Vec<Overlap> = pairs
        .par_iter()
        .map(|&(i, j)| overlap(&frames[i], &frames[j]))
        .collect();

    // N(i, j) and I(i, j) laid out densely; the diagonal holds each
    // frame's own valid area.
    let mut count = DMatrix::<f64>::zeros(n, n);
    let mut mean = DMatrix::<f64>::zeros(n, n);
    for (i, frame) in frames.iter().enumerate() {
        count[(i, i)] = valid_count(frame);
    }
    for (&(i, j), o) in pairs.iter().zip(&overlaps) {
        count[(i, j)] = o.count;
        count[(j, i)] = o.count;
        mean[(i, j)] = o.mean_a;
        mean[(j, i)] = o.mean_b;
    }

    let mut a = DMatrix::<f64>::zeros(n, n);
    let mut b = DVector::<f64>::zeros(n);
    for i in 0..n {
        for j in 0..n {
            let nij = count[(i, j)];
            b[i] += BETA * nij;
            a[(i, i)] += BETA * nij;
            if i == j {
                continue;
            }
            a[(i, i)] += 2.0 * ALPHA * mean[(i, j)] * mean[(i, j)] * nij;
            a[(i, j)] -= 2.0 * ALPHA * mean[(i, j)] * mean[(j, i)] * nij;
        }
    }

    match a.lu().solve(&b) {
        Some(gains) if gains.iter().all(|g| g.is_finite() && *g > 0.0) => {
            gains.iter().copied().collect()
        }
        _ => vec![1.0; n],
    }
}

/// Scale every valid pixel of `frame` by `gain`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn apply_gain(frame: &mut WarpedFrame, gain: f64) {
    if (gain - 1.0).abs() < 1e-9 {
        return;
    }
    for (px, m) in frame.image.pixels_mut().zip(frame.mask.pixels()) {
        if m.0[0] == 0 {
            continue;
        }
        for c in &mut px.0 {
            *c = (f64::from(*c) * gain).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Estimate and apply gains in place; returns the gains used.
pub fn compensate(frames: &mut [WarpedFrame]) -> Vec<f64> {
    let gains = estimate_gains(frames);
    frames
        .par_iter_mut()
        .zip(gains.par_iter())
        .for_each(|(frame, &gain)| apply_gain(frame, gain));
    gains
}
