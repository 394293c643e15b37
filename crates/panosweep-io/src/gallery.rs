//! Saving panoramas into a pictures directory.

use std::path::{Path, PathBuf};

use panosweep_session::PanoramaSink;
use panosweep_stitch::RgbImage;
use tracing::info;

use crate::error::IoError;
use crate::raster::encode_png;

/// Subdirectory of the pictures root that panoramas are written to.
pub const GALLERY_DIR: &str = "Stitcher";

/// Writes `<root>/Stitcher/<name>.png`, creating the directory on demand.
#[derive(Debug, Clone)]
pub struct GalleryWriter {
    root: PathBuf,
}

impl GalleryWriter {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where files end up.
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        self.root.join(GALLERY_DIR)
    }

    fn ensure_directory(&self) -> Result<PathBuf, IoError> {
        let dir = self.directory();
        if std::fs::create_dir_all(&dir).is_err() && !dir.is_dir() {
            return Err(IoError::GalleryDir { path: dir });
        }
        Ok(dir)
    }

    /// Encode and write `panorama` as `<name>.png`.
    ///
    /// # Errors
    ///
    /// - [`IoError::GalleryDir`] if the directory cannot be created.
    /// - [`IoError::PngEncode`] if encoding fails.
    /// - [`IoError::Fs`] if the file cannot be written.
    pub fn write(&self, panorama: &RgbImage, name: &str) -> Result<PathBuf, IoError> {
        let dir = self.ensure_directory()?;
        let path = dir.join(format!("{name}.png"));
        let bytes = encode_png(panorama)?;
        write_file(&path, &bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "saved image");
        Ok(path)
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), IoError> {
    std::fs::write(path, bytes).map_err(|e| IoError::fs(path, e))
}

impl PanoramaSink for GalleryWriter {
    type Error = IoError;

    fn persist(&mut self, panorama: &RgbImage, suggested_name: &str) -> Result<PathBuf, IoError> {
        self.write(panorama, suggested_name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn writes_into_stitcher_subdirectory() {
        let root = tempfile::tempdir().unwrap();
        let writer = GalleryWriter::new(root.path());
        let path = writer.write(&RgbImage::new(3, 2), "2024-01-02-03-04-05").unwrap();
        assert_eq!(path, root.path().join("Stitcher").join("2024-01-02-03-04-05.png"));
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[test]
    fn existing_directory_is_reused() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(GALLERY_DIR)).unwrap();
        let mut writer = GalleryWriter::new(root.path());
        writer.persist(&RgbImage::new(1, 1), "a").unwrap();
        writer.persist(&RgbImage::new(1, 1), "b").unwrap();
        assert_eq!(std::fs::read_dir(writer.directory()).unwrap().count(), 2);
    }

    #[test]
    fn file_in_place_of_directory_fails() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(GALLERY_DIR), b"not a dir").unwrap();
        let writer = GalleryWriter::new(root.path());
        assert!(matches!(
            writer.write(&RgbImage::new(1, 1), "x"),
            Err(IoError::GalleryDir { .. })
        ));
    }
}
