//! Robust planar homography estimation.
//!
//! A Hartley-normalized DLT solver inside a seeded RANSAC loop. The null
//! vector of the DLT system is taken as the eigenvector of `AᵀA` with the
//! smallest eigenvalue, which stays well defined for the minimal
//! four-point sample.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

/// Points in one frame's centered registration coordinates.
pub type Pt = Point2<f64>;

const MIN_SAMPLES: usize = 4;
const CONFIDENCE: f64 = 0.995;

/// Sample points closer to collinear than this (twice the triangle area,
/// in normalized units) are rejected.
const COLLINEAR_EPS: f64 = 1e-6;

/// RANSAC settings for one frame pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacParams {
    /// Inlier threshold on forward transfer error, in pixels.
    pub threshold: f64,
    pub max_iterations: usize,
    pub seed: u64,
}

/// Best consensus homography and its inlier set.
#[derive(Debug, Clone, PartialEq)]
pub struct HomographyFit {
    /// Maps source points to destination points.
    pub h: Matrix3<f64>,
    /// Indices of inlier correspondences, ascending.
    pub inliers: Vec<usize>,
    /// Iterations actually run.
    pub iterations: usize,
}

/// Map a point through `h`, or `None` if it lands at infinity.
#[must_use]
pub fn transform(h: &Matrix3<f64>, p: &Pt) -> Option<Pt> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < f64::EPSILON {
        return None;
    }
    Some(Pt::new(v.x / v.z, v.y / v.z))
}

fn transfer_error_sq(h: &Matrix3<f64>, src: &Pt, dst: &Pt) -> f64 {
    transform(h, src).map_or(f64::INFINITY, |p| (p - dst).norm_squared())
}

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to `sqrt(2)`.
fn normalizing_transform(points: &[Pt]) -> Option<Matrix3<f64>> {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / n;
    if !mean_dist.is_finite() || mean_dist < f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// Direct linear transform over all given correspondences.
///
/// Returns `None` for fewer than four points, coincident points, or a
/// numerically singular result.
#[must_use]
pub fn dlt(src: &[Pt], dst: &[Pt]) -> Option<Matrix3<f64>> {
    if src.len() < MIN_SAMPLES || src.len() != dst.len() {
        return None;
    }
    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src.iter().zip(dst) {
        let s = t_src * Vector3::new(s.x, s.y, 1.0);
        let d = t_dst * Vector3::new(d.x, d.y, 1.0);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r0 = SVector::<f64, 9>::from([-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        let r1 = SVector::<f64, 9>::from([0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
        ata += r0 * r0.transpose() + r1 * r1.transpose();
    }

    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let null = eigen.eigenvectors.column(min_idx);
    let hn = Matrix3::from_fn(|r, c| null[3 * r + c]);

    let h = t_dst.try_inverse()? * hn * t_src;
    normalize(h)
}

/// Scale `h` so `h[(2, 2)] == 1`, rejecting non-finite matrices.
fn normalize(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let scale = h[(2, 2)];
    let h = if scale.abs() > 1e-12 {
        h / scale
    } else {
        h / h.norm()
    };
    h.iter().all(|v| v.is_finite()).then_some(h)
}

/// Rejects homographies that cannot come from a camera rotating in place
/// between two nearby frames: flips, collapses and extreme zooms.
#[must_use]
pub fn is_plausible(h: &Matrix3<f64>) -> bool {
    let det = h[(0, 0)].mul_add(h[(1, 1)], -h[(0, 1)] * h[(1, 0)]);
    det.is_finite() && det > 0.05 && det < 20.0
}

fn nearly_collinear(a: &Pt, b: &Pt, c: &Pt, scale: f64) -> bool {
    let cross = (b.x - a.x).mul_add(c.y - a.y, -(b.y - a.y) * (c.x - a.x));
    cross.abs() < COLLINEAR_EPS * scale * scale
}

fn is_degenerate(points: &[Pt]) -> bool {
    let scale = points
        .iter()
        .map(|p| p.x.abs().max(p.y.abs()))
        .fold(1.0, f64::max);
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            for k in (j + 1)..points.len() {
                if nearly_collinear(&points[i], &points[j], &points[k], scale) {
                    return true;
                }
            }
        }
    }
    false
}

fn inliers_of(h: &Matrix3<f64>, src: &[Pt], dst: &[Pt], threshold_sq: f64) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut total = 0.0;
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let e = transfer_error_sq(h, s, d);
        if e < threshold_sq {
            inliers.push(i);
            total += e;
        }
    }
    (inliers, total)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn adaptive_iterations(inlier_ratio: f64, so_far: usize, max: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return max;
    }
    let denom = (1.0 - inlier_ratio.powi(MIN_SAMPLES as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max;
    }
    let needed = ((1.0 - CONFIDENCE).ln() / denom).ceil();
    (needed as usize).clamp(so_far, max)
}

/// Fit a homography mapping `src` onto `dst` with RANSAC.
///
/// The winning model is refit once on its inliers; the refit replaces it
/// only if it keeps at least as many inliers. Returns `None` when no
/// non-degenerate sample produced a plausible model.
#[must_use]
pub fn ransac(src: &[Pt], dst: &[Pt], params: RansacParams) -> Option<HomographyFit> {
    let n = src.len();
    if n < MIN_SAMPLES || n != dst.len() {
        return None;
    }

    let threshold_sq = params.threshold * params.threshold;
    let all: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut best: Option<(Matrix3<f64>, Vec<usize>, f64)> = None;
    let mut limit = params.max_iterations;
    let mut iterations = 0;
    let mut sample_src = [Pt::origin(); MIN_SAMPLES];
    let mut sample_dst = [Pt::origin(); MIN_SAMPLES];

    while iterations < limit {
        iterations += 1;
        for (k, &idx) in all.choose_multiple(&mut rng, MIN_SAMPLES).enumerate() {
            sample_src[k] = src[idx];
            sample_dst[k] = dst[idx];
        }
        if is_degenerate(&sample_src) || is_degenerate(&sample_dst) {
            continue;
        }
        let Some(h) = dlt(&sample_src, &sample_dst) else {
            continue;
        };
        if !is_plausible(&h) {
            continue;
        }

        let (inliers, error) = inliers_of(&h, src, dst, threshold_sq);
        let better = best.as_ref().is_none_or(|(_, best_inliers, best_error)| {
            inliers.len() > best_inliers.len()
                || (inliers.len() == best_inliers.len() && error < *best_error)
        });
        if better {
            #[allow(clippy::cast_precision_loss)]
            let ratio = inliers.len() as f64 / n as f64;
            limit = adaptive_iterations(ratio, iterations, params.max_iterations);
            best = Some((h, inliers, error));
        }
    }

    let (mut h, mut inliers, _) = best?;
    if inliers.len() < MIN_SAMPLES {
        return None;
    }

    let inlier_src: Vec<Pt> = inliers.iter().map(|&i| src[i]).collect();
    let inlier_dst: Vec<Pt> = inliers.iter().map(|&i| dst[i]).collect();
    if let Some(refit) = dlt(&inlier_src, &inlier_dst).filter(is_plausible) {
        let (refit_inliers, _) = inliers_of(&refit, src, dst, threshold_sq);
        if refit_inliers.len() >= inliers.len() {
            h = refit;
            inliers = refit_inliers;
        }
    }

    Some(HomographyFit {
        h,
        inliers,
        iterations,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ground_truth() -> Matrix3<f64> {
        Matrix3::new(0.95, 0.04, 12.0, -0.03, 1.02, -5.0, 1e-4, -2e-4, 1.0)
    }

    fn grid() -> Vec<Pt> {
        let mut pts = Vec::new();
        for i in 0..8 {
            for j in 0..6 {
                pts.push(Pt::new(
                    f64::from(i).mul_add(17.0, -60.0) + f64::from(j) * 1.3,
                    f64::from(j).mul_add(19.0, -50.0) - f64::from(i) * 0.7,
                ));
            }
        }
        pts
    }

    const PARAMS: RansacParams = RansacParams {
        threshold: 1.0,
        max_iterations: 500,
        seed: 42,
    };

    #[test]
    fn dlt_recovers_exact_homography() {
        let h = ground_truth();
        let src = grid();
        let dst: Vec<Pt> = src.iter().map(|p| transform(&h, p).unwrap()).collect();
        let est = dlt(&src, &dst).unwrap();
        assert!((est - h).norm() < 1e-6, "{est}");
    }

    #[test]
    fn dlt_needs_four_points() {
        let pts = vec![Pt::new(0.0, 0.0), Pt::new(1.0, 0.0), Pt::new(0.0, 1.0)];
        assert!(dlt(&pts, &pts).is_none());
    }

    #[test]
    fn ransac_rejects_outliers() {
        let h = ground_truth();
        let src = grid();
        let mut dst: Vec<Pt> = src.iter().map(|p| transform(&h, p).unwrap()).collect();
        for (k, p) in dst.iter_mut().enumerate().step_by(7) {
            p.x += 40.0 + f64::from(u32::try_from(k).unwrap());
            p.y -= 25.0;
        }
        let fit = ransac(&src, &dst, PARAMS).unwrap();
        let outliers = src.len().div_ceil(7);
        assert_eq!(fit.inliers.len(), src.len() - outliers);
        assert!(fit.inliers.iter().all(|i| i % 7 != 0));
        assert!((fit.h - h).norm() < 1e-4);
    }

    #[test]
    fn ransac_is_deterministic_for_seed() {
        let h = ground_truth();
        let src = grid();
        let mut dst: Vec<Pt> = src.iter().map(|p| transform(&h, p).unwrap()).collect();
        dst[3].x += 30.0;
        let a = ransac(&src, &dst, PARAMS).unwrap();
        let b = ransac(&src, &dst, PARAMS).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn collinear_points_are_degenerate() {
        let pts = [
            Pt::new(0.0, 0.0),
            Pt::new(1.0, 1.0),
            Pt::new(2.0, 2.0),
            Pt::new(5.0, -3.0),
        ];
        assert!(is_degenerate(&pts));
    }

    #[test]
    fn mirror_is_implausible() {
        let mirror = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_plausible(&mirror));
        assert!(is_plausible(&Matrix3::identity()));
    }
}
