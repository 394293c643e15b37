//! Host-side collaborators: where panoramas are saved and shown.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone};
use panosweep_stitch::RgbImage;

/// Message shown when a stitch fails.
pub const FAILURE_MESSAGE: &str = "Failed to stitch!";

/// `strftime` pattern for suggested file names: a 12-hour clock, with no
/// AM/PM marker.
pub const NAME_FORMAT: &str = "%Y-%m-%d-%I-%M-%S";

/// Persists a finished panorama.
pub trait PanoramaSink {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Store `panorama` under a name derived from `suggested_name` and
    /// return where it went.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn persist(
        &mut self,
        panorama: &RgbImage,
        suggested_name: &str,
    ) -> Result<PathBuf, Self::Error>;
}

/// Displays the panorama for the current options.
pub trait PanoramaView {
    fn show(&mut self, panorama: &RgbImage);

    /// The stitch failed; the host should return to capture.
    fn show_failure(&mut self);
}

/// File name stem for a panorama saved at `when`.
#[must_use]
pub fn suggested_name<Tz: TimeZone>(when: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    when.format(NAME_FORMAT).to_string()
}
