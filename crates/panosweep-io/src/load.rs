//! Decoding image files into frames.
//!
//! Anything the `image` crate can decode (PNG, JPEG, BMP, WebP) is
//! accepted. Alpha is dropped and every frame ends up as 8-bit RGB.

use std::path::Path;

use panosweep_stitch::{Frame, FrameSequence};
use tracing::debug;

use crate::error::IoError;

/// Decode raw image bytes into a frame.
///
/// # Errors
///
/// Returns [`IoError::Decode`] if the format is unrecognized or the data
/// is corrupt.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, IoError> {
    let image = image::load_from_memory(bytes).map_err(|e| IoError::Decode(e.to_string()))?;
    Ok(Frame::new(image.to_rgb8()))
}

/// Read and decode one image file.
///
/// # Errors
///
/// - [`IoError::Fs`] if the file cannot be read.
/// - [`IoError::EmptyInput`] if it is empty.
/// - [`IoError::Decode`] if it is not a decodable image.
pub fn load_frame(path: impl AsRef<Path>) -> Result<Frame, IoError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| IoError::fs(path, e))?;
    if bytes.is_empty() {
        return Err(IoError::EmptyInput {
            path: path.to_path_buf(),
        });
    }
    let frame = decode_frame(&bytes)?;
    debug!(
        path = %path.display(),
        width = frame.width(),
        height = frame.height(),
        "loaded frame"
    );
    Ok(frame)
}

/// Load several files as a sweep, in the given order.
///
/// # Errors
///
/// The first error from [`load_frame`].
pub fn load_frames<P: AsRef<Path>>(
    paths: impl IntoIterator<Item = P>,
) -> Result<FrameSequence, IoError> {
    paths
        .into_iter()
        .map(load_frame)
        .collect::<Result<Vec<_>, _>>()
        .map(FrameSequence::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(matches!(decode_frame(&[0xFF, 0xFE, 0x00, 0x01]), Err(IoError::Decode(_))));
    }

    #[test]
    fn rgba_is_flattened_to_rgb() {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 40]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        let frame = decode_frame(bytes.get_ref()).unwrap();
        assert_eq!(frame.dimensions().width, 3);
        assert_eq!(frame.image().get_pixel(1, 1).0, [10, 20, 30]);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_frame("/definitely/not/here.png").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.png"));
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.png");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(load_frame(&path), Err(IoError::EmptyInput { .. })));
    }
}
