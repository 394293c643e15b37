//! panosweep-io: filesystem collaborators for panosweep.
//!
//! Loads frames from image files, encodes panoramas as PNG, and saves them
//! into a `Stitcher` gallery directory through the
//! [`PanoramaSink`](panosweep_session::PanoramaSink) seam.

pub mod error;
pub mod gallery;
pub mod load;
pub mod raster;

pub use error::IoError;
pub use gallery::{GALLERY_DIR, GalleryWriter};
pub use load::{decode_frame, load_frame, load_frames};
pub use raster::{encode_png, to_display_rgba};
