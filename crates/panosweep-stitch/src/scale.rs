//! Registration-resolution scaling.
//!
//! Feature extraction, matching and camera estimation run on grayscale
//! copies reduced to roughly `work_megapix` megapixels. Composition always
//! uses the full-resolution frames, so the scale factor travels with the
//! registration data and is undone when focal lengths are handed to the
//! warper.

use image::GrayImage;
use image::imageops::FilterType;

use crate::types::{Dimensions, RgbImage};

/// Scale factor that brings an image of `dimensions` down to at most
/// `work_megapix` megapixels. Never upscales.
#[must_use]
pub fn work_scale(dimensions: Dimensions, work_megapix: f64) -> f64 {
    let area = f64::from(dimensions.width) * f64::from(dimensions.height);
    if area <= 0.0 {
        return 1.0;
    }
    (work_megapix * 1e6 / area).sqrt().min(1.0)
}

/// Grayscale registration copy of `frame` at `scale`.
///
/// Uses the Triangle filter, matching the resampling used elsewhere for
/// working-resolution reductions.
#[must_use = "returns the registration image"]
pub fn registration_image(frame: &RgbImage, scale: f64) -> GrayImage {
    let gray = image::imageops::grayscale(frame);
    if scale >= 1.0 {
        return gray;
    }

    let (w, h) = scaled_size(frame.width(), frame.height(), scale);
    image::imageops::resize(&gray, w, h, FilterType::Triangle)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled_size(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    (w, h)
}
