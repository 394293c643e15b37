//! Raster encoding and display conversion.

use image::ImageEncoder;
use panosweep_stitch::RgbImage;

use crate::error::IoError;

/// Encode an RGB panorama as PNG bytes.
///
/// # Errors
///
/// Returns [`IoError::PngEncode`] if encoding fails.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, IoError> {
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| IoError::PngEncode(e.to_string()))?;
    Ok(png_bytes)
}

/// Opaque RGBA copy of `image` for display surfaces that want four
/// channels.
#[must_use]
pub fn to_display_rgba(image: &RgbImage) -> image::RgbaImage {
    image::RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        image::Rgba([r, g, b, u8::MAX])
    })
}
