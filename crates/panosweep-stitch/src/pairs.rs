//! Registration of one frame pair.
//!
//! Descriptor matches are lifted to centered registration coordinates
//! (origin at the image center) and fed to RANSAC. A pair is accepted when
//! its inlier count is both large in absolute terms and large relative to
//! the number of putative matches.

use nalgebra::Matrix3;
use tracing::debug;

use crate::features::FrameFeatures;
use crate::homography::{self, Pt, RansacParams};
use crate::matcher;
use crate::types::StitchConfig;

/// Inliers kept per pair for bundle adjustment, evenly strided.
pub const MAX_INLIERS_KEPT: usize = 100;

/// An accepted frame pair.
#[derive(Debug, Clone)]
pub struct PairMatch {
    pub from: usize,
    pub to: usize,
    /// Maps centered registration coordinates of `from` onto `to`.
    pub h: Matrix3<f64>,
    /// Putative matches after ratio test and cross-check.
    pub matches: usize,
    /// Total RANSAC inliers.
    pub inlier_count: usize,
    /// Subset of inlier correspondences `(point in from, point in to)`.
    pub inliers: Vec<(Pt, Pt)>,
    /// `inliers / (8 + 0.3 * matches)`.
    pub confidence: f64,
}

impl PairMatch {
    /// Mean displacement of the kept inliers in registration pixels.
    /// Infinite when no inliers were kept.
    #[must_use]
    pub fn mean_motion(&self) -> f64 {
        if self.inliers.is_empty() {
            return f64::INFINITY;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.inliers.len() as f64;
        self.inliers.iter().map(|(a, b)| (b - a).norm()).sum::<f64>() / n
    }

    /// The same registration seen from `to`; `None` if `h` is singular.
    #[must_use]
    pub fn reversed(&self) -> Option<Self> {
        let h = self.h.try_inverse()?;
        Some(Self {
            from: self.to,
            to: self.from,
            h,
            matches: self.matches,
            inlier_count: self.inlier_count,
            inliers: self.inliers.iter().map(|&(a, b)| (b, a)).collect(),
            confidence: self.confidence,
        })
    }
}

/// Acceptance score of a pair.
#[must_use]
pub fn pair_confidence(inliers: usize, matches: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let (inliers, matches) = (inliers as f64, matches as f64);
    inliers / 0.3f64.mul_add(matches, 8.0)
}

fn centered(features: &FrameFeatures, idx: usize) -> Pt {
    let kp = features.keypoints[idx];
    let (cx, cy) = features.dimensions.map_or((0.0, 0.0), |d| {
        (f64::from(d.width) / 2.0, f64::from(d.height) / 2.0)
    });
    Pt::new(f64::from(kp.x) - cx, f64::from(kp.y) - cy)
}

fn pair_seed(base: u64, from: usize, to: usize) -> u64 {
    let key = ((from as u64) << 32) | to as u64;
    base ^ key.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Match, fit and judge frames `from` and `to`.
///
/// Returns `None` for rejected pairs; the reason is logged at debug level.
#[must_use]
pub fn register_pair(
    from: usize,
    to: usize,
    a: &FrameFeatures,
    b: &FrameFeatures,
    config: &StitchConfig,
) -> Option<PairMatch> {
    let matches = matcher::match_descriptors(&a.descriptors, &b.descriptors, config.match_ratio);
    if matches.len() < config.min_inliers {
        debug!(from, to, matches = matches.len(), "pair rejected: too few matches");
        return None;
    }

    let src: Vec<Pt> = matches.iter().map(|m| centered(a, m.query)).collect();
    let dst: Vec<Pt> = matches.iter().map(|m| centered(b, m.train)).collect();

    let params = RansacParams {
        threshold: config.ransac_threshold,
        max_iterations: config.ransac_iterations,
        seed: pair_seed(config.ransac_seed, from, to),
    };
    let Some(fit) = homography::ransac(&src, &dst, params) else {
        debug!(from, to, matches = matches.len(), "pair rejected: no homography");
        return None;
    };

    let confidence = pair_confidence(fit.inliers.len(), matches.len());
    if fit.inliers.len() < config.min_inliers || confidence <= config.match_confidence {
        debug!(
            from,
            to,
            matches = matches.len(),
            inliers = fit.inliers.len(),
            confidence,
            "pair rejected: weak consensus"
        );
        return None;
    }

    let stride = fit.inliers.len().div_ceil(MAX_INLIERS_KEPT).max(1);
    let inliers = fit
        .inliers
        .iter()
        .step_by(stride)
        .map(|&i| (src[i], dst[i]))
        .collect();

    debug!(
        from,
        to,
        matches = matches.len(),
        inliers = fit.inliers.len(),
        confidence,
        "pair accepted"
    );
    Some(PairMatch {
        from,
        to,
        h: fit.h,
        matches: matches.len(),
        inlier_count: fit.inliers.len(),
        inliers,
        confidence,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn confidence_formula() {
        assert!((pair_confidence(38, 100) - 1.0).abs() < 1e-12);
        assert!(pair_confidence(0, 10) < f64::EPSILON);
    }

    #[test]
    fn pair_seeds_differ_per_pair() {
        assert_ne!(pair_seed(7, 0, 1), pair_seed(7, 1, 0));
        assert_ne!(pair_seed(7, 0, 1), pair_seed(7, 0, 2));
        assert_eq!(pair_seed(7, 2, 3), pair_seed(7, 2, 3));
    }

    #[test]
    fn motion_is_mean_inlier_shift() {
        let pair = PairMatch {
            from: 0,
            to: 1,
            h: Matrix3::identity(),
            matches: 2,
            inlier_count: 2,
            inliers: vec![
                (Pt::new(0.0, 0.0), Pt::new(3.0, 4.0)),
                (Pt::new(10.0, 10.0), Pt::new(10.0, 11.0)),
            ],
            confidence: 2.0,
        };
        assert!((pair.mean_motion() - 3.0).abs() < 1e-12);

        let back = pair.reversed().unwrap();
        assert_eq!((back.from, back.to), (1, 0));
        assert_eq!(back.inliers[0], (Pt::new(3.0, 4.0), Pt::new(0.0, 0.0)));
        assert!(PairMatch { inliers: Vec::new(), ..pair }.mean_motion().is_infinite());
    }

    #[test]
    fn featureless_frames_are_rejected() {
        let empty = FrameFeatures::default();
        assert!(register_pair(0, 1, &empty, &empty, &StitchConfig::default()).is_none());
    }
}
