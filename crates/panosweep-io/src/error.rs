use std::path::PathBuf;

/// Errors from loading frames or writing panoramas.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// The file contained no bytes.
    #[error("{}: file is empty", path.display())]
    EmptyInput { path: PathBuf },

    /// A filesystem operation failed.
    #[error("{}: {source}", path.display())]
    Fs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bytes are not an image format we can decode.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// PNG encoding failed.
    #[error("PNG encoding failed: {0}")]
    PngEncode(String),

    /// The gallery directory could not be created.
    #[error("unable to create gallery directory {}", path.display())]
    GalleryDir { path: PathBuf },
}

impl IoError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Fs {
            path: path.into(),
            source,
        }
    }
}
