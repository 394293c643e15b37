//! Initial camera estimation from pairwise homographies.
//!
//! Every frame is modelled as a pinhole camera rotating about a common
//! center. A world ray for pixel `x` (centered registration coordinates)
//! is `R * K⁻¹ * x` with `K = diag(f, f, 1)`, so the homography taking
//! frame `a` to frame `b` is `K_b * R_bᵀ * R_a * K_a⁻¹`.
//!
//! Focal lengths come from the closed-form relations between a rotation
//! homography and its focal lengths; rotations are chained along the
//! spanning tree starting from the identity at its center.

use nalgebra::Matrix3;

use crate::graph::SpanningTree;
use crate::pairs::PairMatch;
use crate::types::Dimensions;

/// One camera's intrinsics and orientation in registration pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraParams {
    /// Focal length.
    pub focal: f64,
    /// Camera-to-world rotation.
    pub rotation: Matrix3<f64>,
}

impl CameraParams {
    /// Intrinsic matrix in centered coordinates.
    #[must_use]
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(self.focal, 0.0, 0.0, 0.0, self.focal, 0.0, 0.0, 0.0, 1.0)
    }

    #[must_use]
    pub fn k_inv(&self) -> Matrix3<f64> {
        let inv = 1.0 / self.focal;
        Matrix3::new(inv, 0.0, 0.0, 0.0, inv, 0.0, 0.0, 0.0, 1.0)
    }
}

/// Pick a focal-squared candidate from two `numerator / denominator`
/// estimates. When both are positive the better conditioned one (larger
/// denominator) wins.
fn focal_candidate(n1: f64, d1: f64, n2: f64, d2: f64) -> Option<f64> {
    let ratio = |n: f64, d: f64| {
        let v = n / d;
        (d != 0.0 && v.is_finite()).then_some(v)
    };
    let squared = match (ratio(n1, d1), ratio(n2, d2)) {
        (Some(v1), Some(v2)) if v1 > 0.0 && v2 > 0.0 => {
            if d1.abs() > d2.abs() {
                v1
            } else {
                v2
            }
        }
        (Some(v1), Some(v2)) => v1.max(v2),
        (Some(v), None) | (None, Some(v)) => v,
        (None, None) => return None,
    };
    (squared > 0.0).then(|| squared.sqrt())
}

/// Focal lengths `(f_src, f_dst)` implied by a rotation homography that
/// maps source pixels to destination pixels.
///
/// Either value is `None` when the homography does not constrain it, for
/// example when the rotation axis makes a denominator vanish.
#[must_use]
pub fn focals_from_homography(h: &Matrix3<f64>) -> (Option<f64>, Option<f64>) {
    let h = h.transpose();
    let h = h.as_slice();

    let dst = focal_candidate(
        -h[0].mul_add(h[1], h[3] * h[4]),
        h[6] * h[7],
        h[0].mul_add(h[0], h[3] * h[3]) - h[1].mul_add(h[1], h[4] * h[4]),
        (h[7] - h[6]) * (h[7] + h[6]),
    );
    let src = focal_candidate(
        -h[2] * h[5],
        h[0].mul_add(h[3], h[1] * h[4]),
        h[5].mul_add(h[5], -h[2] * h[2]),
        h[0].mul_add(h[0], h[1] * h[1]) - h[3].mul_add(h[3], h[4] * h[4]),
    );
    (src, dst)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some(f64::midpoint(values[mid - 1], values[mid]))
    }
}

/// Shared initial focal length for all frames.
///
/// The median of per-pair estimates when at least `frames - 1` pairs
/// yield one, otherwise the mean of `width + height` over the frames.
#[must_use]
pub fn estimate_focal(pairs: &[PairMatch], dims: &[Dimensions]) -> f64 {
    let mut focals: Vec<f64> = pairs
        .iter()
        .filter_map(|p| {
            let inv = p.h.try_inverse()?;
            match focals_from_homography(&inv) {
                (Some(f0), Some(f1)) => Some((f0 * f1).sqrt()),
                _ => None,
            }
        })
        .collect();

    if focals.len() + 1 >= dims.len()
        && let Some(f) = median(&mut focals)
        && f.is_finite()
        && f > 0.0
    {
        return f;
    }

    fallback_focal(dims)
}

fn fallback_focal(dims: &[Dimensions]) -> f64 {
    if dims.is_empty() {
        return 1.0;
    }
    let sum: f64 = dims
        .iter()
        .map(|d| f64::from(d.width) + f64::from(d.height))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let n = dims.len() as f64;
    sum / n
}

/// Closest rotation matrix to `m` in the Frobenius sense.
#[must_use]
pub fn orthonormalize(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        r = -r;
    }
    r
}

/// Chain rotations down the spanning tree, starting from the identity at
/// the tree center.
///
/// Frames the tree does not reach keep the identity.
#[must_use]
pub fn initial_cameras(
    frame_count: usize,
    pairs: &[PairMatch],
    tree: &SpanningTree,
    focal: f64,
) -> Vec<CameraParams> {
    let mut cameras = vec![
        CameraParams {
            focal,
            rotation: Matrix3::identity(),
        };
        frame_count
    ];

    for step in &tree.steps {
        let pair = &pairs[step.pair];
        let parent = cameras[step.parent];
        let k = parent.k();
        let k_inv = parent.k_inv();
        let relative = if pair.from == step.parent {
            pair.h.try_inverse().map(|h_inv| k_inv * h_inv * k)
        } else {
            Some(k_inv * pair.h * k)
        };
        let rotation = relative.map_or(parent.rotation, |rel| {
            orthonormalize(&(parent.rotation * rel))
        });
        cameras[step.child].rotation = rotation;
    }

    cameras
}
