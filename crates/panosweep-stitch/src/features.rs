//! Oriented FAST keypoints with steered BRIEF descriptors.
//!
//! Keypoints are detected with FAST-9 on a small image pyramid (scale
//! factor 1.2 per level), thinned by 3x3 non-maximum suppression, and
//! ranked by FAST score. Each keypoint gets an orientation from the
//! intensity centroid of a circular patch, and a 256-bit BRIEF descriptor
//! whose sampling pattern is rotated by that orientation.
//!
//! The sampling pattern is drawn once from a fixed seed, so extraction is
//! a pure function of the input image and parameters.

use std::sync::LazyLock;

use image::GrayImage;
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::Dimensions;

/// Downscale factor between consecutive pyramid levels.
pub const LEVEL_SCALE: f32 = 1.2;

/// Radius of the intensity-centroid patch.
const ORIENTATION_RADIUS: i32 = 15;

/// Half extent of the unrotated BRIEF sampling square.
const PATTERN_HALF_EXTENT: i32 = 12;

/// Keypoints closer than this to a level's border are discarded, so both
/// the orientation patch and the rotated pattern stay inside the image.
const BORDER: u32 = 18;

/// Smoothing applied before sampling descriptor pairs.
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;

const PATTERN_SEED: u64 = 0x0B_81EF;
const PATTERN_PAIRS: usize = 256;

static PATTERN: LazyLock<Vec<[f32; 4]>> = LazyLock::new(|| {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    (0..PATTERN_PAIRS)
        .map(|_| {
            std::array::from_fn(|_| {
                #[allow(clippy::cast_precision_loss)]
                let v = rng.random_range(-PATTERN_HALF_EXTENT..=PATTERN_HALF_EXTENT) as f32;
                v
            })
        })
        .collect()
});

/// A detected keypoint in level-0 registration coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Orientation in radians.
    pub angle: f32,
    /// Pyramid level the keypoint was found on.
    pub level: usize,
    /// FAST corner score.
    pub score: f32,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    /// Hamming distance to `other`.
    #[must_use]
    pub fn hamming(&self, other: &Self) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints and descriptors of one registration image.
///
/// `keypoints[i]` is described by `descriptors[i]`.
#[derive(Debug, Clone, Default)]
pub struct FrameFeatures {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// Size of the registration image the features were extracted from.
    pub dimensions: Option<Dimensions>,
}

impl FrameFeatures {
    #[must_use]
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Detector settings, lifted out of [`crate::StitchConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureParams {
    pub max_features: usize,
    pub fast_threshold: u8,
    pub levels: usize,
}

/// Detect and describe keypoints in a grayscale registration image.
#[must_use = "returns the extracted features"]
pub fn extract(image: &GrayImage, params: FeatureParams) -> FrameFeatures {
    let dimensions = Dimensions {
        width: image.width(),
        height: image.height(),
    };

    let mut found: Vec<(Keypoint, Descriptor)> = Vec::new();
    for level in 0..params.levels.max(1) {
        let Some(level_image) = level_image(image, level) else {
            break;
        };
        found.extend(detect_level(&level_image, image, level, params));
    }

    found.sort_by(|(a, _), (b, _)| {
        b.score
            .total_cmp(&a.score)
            .then(a.level.cmp(&b.level))
            .then(a.y.total_cmp(&b.y))
            .then(a.x.total_cmp(&b.x))
    });
    found.truncate(params.max_features);

    let (keypoints, descriptors) = found.into_iter().unzip();
    FrameFeatures {
        keypoints,
        descriptors,
        dimensions: Some(dimensions),
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
fn level_image(image: &GrayImage, level: usize) -> Option<GrayImage> {
    if level == 0 {
        return Some(image.clone());
    }
    let scale = LEVEL_SCALE.powi(level as i32);
    let w = (image.width() as f32 / scale).round() as u32;
    let h = (image.height() as f32 / scale).round() as u32;
    if w <= 2 * BORDER || h <= 2 * BORDER {
        return None;
    }
    Some(image::imageops::resize(image, w, h, FilterType::Triangle))
}

#[allow(clippy::cast_precision_loss)]
fn detect_level(
    level_image: &GrayImage,
    base: &GrayImage,
    level: usize,
    params: FeatureParams,
) -> Vec<(Keypoint, Descriptor)> {
    let (w, h) = level_image.dimensions();
    if w <= 2 * BORDER || h <= 2 * BORDER {
        return Vec::new();
    }

    let corners: Vec<_> = imageproc::corners::corners_fast9(level_image, params.fast_threshold)
        .into_iter()
        .filter(|c| c.x >= BORDER && c.x < w - BORDER && c.y >= BORDER && c.y < h - BORDER)
        .collect();
    let corners = suppress_non_maxima(&corners, w, h);
    if corners.is_empty() {
        return Vec::new();
    }

    let smoothed = imageproc::filter::gaussian_blur_f32(level_image, DESCRIPTOR_BLUR_SIGMA);
    let sx = base.width() as f32 / w as f32;
    let sy = base.height() as f32 / h as f32;

    corners
        .into_iter()
        .map(|corner| {
            let angle = orientation(level_image, corner.x, corner.y);
            let descriptor = describe(&smoothed, corner.x, corner.y, angle);
            let keypoint = Keypoint {
                x: corner.x as f32 * sx,
                y: corner.y as f32 * sy,
                angle,
                level,
                score: corner.score,
            };
            (keypoint, descriptor)
        })
        .collect()
}

/// Keep corners whose score is not beaten by any 8-neighbour.
///
/// Ties go to the corner that comes first in row-major order.
fn suppress_non_maxima(
    corners: &[imageproc::corners::Corner],
    width: u32,
    height: u32,
) -> Vec<imageproc::corners::Corner> {
    let w = width as usize;
    let mut scores = vec![f32::NEG_INFINITY; w * height as usize];
    for c in corners {
        scores[c.y as usize * w + c.x as usize] = c.score;
    }

    corners
        .iter()
        .filter(|c| {
            let (cx, cy) = (c.x as usize, c.y as usize);
            let here = cy * w + cx;
            for ny in cy.saturating_sub(1)..=(cy + 1).min(height as usize - 1) {
                for nx in cx.saturating_sub(1)..=(cx + 1).min(w - 1) {
                    let idx = ny * w + nx;
                    if idx == here {
                        continue;
                    }
                    let other = scores[idx];
                    if other > c.score || (other == c.score && idx < here) {
                        return false;
                    }
                }
            }
            true
        })
        .copied()
        .collect()
}

/// Intensity-centroid orientation of the circular patch around `(x, y)`.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn orientation(image: &GrayImage, x: u32, y: u32) -> f32 {
    let (cx, cy) = (x as i32, y as i32);
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    let mut m10 = 0i64;
    let mut m01 = 0i64;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = i64::from(image.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0]);
            m10 += i64::from(dx) * v;
            m01 += i64::from(dy) * v;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let angle = (m01 as f32).atan2(m10 as f32);
    angle
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
fn describe(smoothed: &GrayImage, x: u32, y: u32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let max_x = smoothed.width() as i32 - 1;
    let max_y = smoothed.height() as i32 - 1;
    let sample = |px: f32, py: f32| {
        let rx = cos.mul_add(px, -sin * py);
        let ry = sin.mul_add(px, cos * py);
        let sx = (x as i32 + rx.round() as i32).clamp(0, max_x);
        let sy = (y as i32 + ry.round() as i32).clamp(0, max_y);
        smoothed.get_pixel(sx as u32, sy as u32).0[0]
    };

    let mut bits = [0u64; 4];
    for (i, pair) in PATTERN.iter().enumerate() {
        if sample(pair[0], pair[1]) < sample(pair[2], pair[3]) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    Descriptor(bits)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PARAMS: FeatureParams = FeatureParams {
        max_features: 200,
        fast_threshold: 20,
        levels: 3,
    };

    /// Scattered bright rectangles on a dark background.
    fn blocks_image() -> GrayImage {
        GrayImage::from_fn(160, 120, |x, y| {
            let cell = (x / 23) * 7 + (y / 19) * 3;
            let inside = x % 23 > 6 && y % 19 > 5;
            if inside && cell % 2 == 0 {
                image::Luma([220])
            } else {
                image::Luma([30])
            }
        })
    }

    #[test]
    fn flat_image_has_no_features() {
        let image = GrayImage::from_pixel(100, 100, image::Luma([128]));
        assert!(extract(&image, PARAMS).is_empty());
    }

    #[test]
    fn tiny_image_has_no_features() {
        let image = GrayImage::from_pixel(20, 20, image::Luma([128]));
        assert!(extract(&image, PARAMS).is_empty());
    }

    #[test]
    fn blocks_produce_features_inside_border() {
        let image = blocks_image();
        let features = extract(&image, PARAMS);
        assert!(features.len() > 10, "only {} features", features.len());
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        for kp in &features.keypoints {
            assert!(kp.x >= 0.0 && kp.x < 160.0);
            assert!(kp.y >= 0.0 && kp.y < 120.0);
        }
    }

    #[test]
    fn max_features_caps_output() {
        let params = FeatureParams {
            max_features: 5,
            ..PARAMS
        };
        assert!(extract(&blocks_image(), params).len() <= 5);
    }

    #[test]
    fn extraction_is_deterministic() {
        let image = blocks_image();
        let a = extract(&image, PARAMS);
        let b = extract(&image, PARAMS);
        assert_eq!(a.keypoints, b.keypoints);
        assert_eq!(a.descriptors, b.descriptors);
    }

    #[test]
    fn keypoints_are_sorted_by_score() {
        let features = extract(&blocks_image(), PARAMS);
        for pair in features.keypoints.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn hamming_counts_differing_bits() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, 0, u64::MAX]);
        assert_eq!(a.hamming(&b), 3 + 64);
        assert_eq!(b.hamming(&b), 0);
    }

    #[test]
    fn orientation_points_towards_bright_side() {
        let image = GrayImage::from_fn(64, 64, |x, _| {
            if x > 32 {
                image::Luma([255])
            } else {
                image::Luma([0])
            }
        });
        let angle = orientation(&image, 32, 32);
        assert!(angle.abs() < 0.1, "angle {angle}");
    }
}
