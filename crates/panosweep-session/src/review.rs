//! Reviewing a finished sweep under the two quality toggles.
//!
//! [`Review`] holds the current [`StitchOptions`] and serves results from
//! the session cache, calling the engine only for option values that have
//! not been stitched since the frames last changed.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use panosweep_stitch::{StitchOptions, StitchResult};
use tracing::{debug, info};

use crate::collaborators::{PanoramaSink, PanoramaView, suggested_name};
use crate::engine::StitchEngine;
use crate::error::SessionError;
use crate::session::Session;

#[derive(Debug)]
pub struct Review<E> {
    session: Session,
    engine: E,
    options: StitchOptions,
    current: Option<StitchResult>,
}

impl<E: StitchEngine> Review<E> {
    /// Start reviewing with both toggles on.
    #[must_use]
    pub fn new(session: Session, engine: E) -> Self {
        Self::with_options(session, engine, StitchOptions::default())
    }

    #[must_use]
    pub const fn with_options(session: Session, engine: E, options: StitchOptions) -> Self {
        Self {
            session,
            engine,
            options,
            current: None,
        }
    }

    #[must_use]
    pub const fn options(&self) -> StitchOptions {
        self.options
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// The result last returned by [`render`](Self::render).
    #[must_use]
    pub const fn current(&self) -> Option<&StitchResult> {
        self.current.as_ref()
    }

    /// Result for the current options, from cache when possible.
    pub fn render(&mut self) -> StitchResult {
        let options = self.options;
        let result = if let Some(hit) = self.session.cached(options) {
            debug!(?options, "stitch cache hit");
            hit
        } else {
            let snapshot = self.session.snapshot();
            let result = self.engine.stitch(&snapshot.frames, options);
            self.session.store(snapshot.epoch, options, result.clone());
            result
        };
        self.current = Some(result.clone());
        result
    }

    /// Render and hand the outcome to `view`.
    pub fn present(&mut self, view: &mut impl PanoramaView) -> StitchResult {
        let result = self.render();
        match result.panorama() {
            Some(panorama) => view.show(panorama),
            None => view.show_failure(),
        }
        result
    }

    /// Flip wave correction and re-render.
    pub fn toggle_wave_correction(&mut self) -> StitchResult {
        self.options = self.options.with_wave_correct_toggled();
        self.render()
    }

    /// Switch between multi-band and feather blending and re-render.
    pub fn toggle_blender(&mut self) -> StitchResult {
        self.options = self.options.with_blender_toggled();
        self.render()
    }

    #[must_use]
    pub const fn wave_correction_label(&self) -> &'static str {
        if self.options.wave_correct {
            "Wave Correction is On"
        } else {
            "Wave Correction is Off"
        }
    }

    #[must_use]
    pub const fn blender_label(&self) -> &'static str {
        if self.options.multi_band {
            "Using Multiband Blending"
        } else {
            "Using Feather Blending"
        }
    }

    /// Save the displayed panorama, named after the local time.
    ///
    /// # Errors
    ///
    /// See [`save_at`](Self::save_at).
    pub fn save<S: PanoramaSink>(&self, sink: &mut S) -> Result<PathBuf, SessionError> {
        self.save_at(sink, &Local::now())
    }

    /// Save the displayed panorama, named after `when`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NothingToSave`] if nothing was rendered or the
    ///   last render failed.
    /// - [`SessionError::Persist`] if `sink` fails.
    pub fn save_at<S: PanoramaSink>(
        &self,
        sink: &mut S,
        when: &DateTime<Local>,
    ) -> Result<PathBuf, SessionError> {
        let panorama = self
            .current
            .as_ref()
            .and_then(StitchResult::panorama)
            .ok_or(SessionError::NothingToSave)?;
        let path = sink
            .persist(panorama, &suggested_name(when))
            .map_err(|e| SessionError::Persist(Box::new(e)))?;
        info!(path = %path.display(), "saved panorama");
        Ok(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use panosweep_stitch::{Frame, FrameSequence, RgbImage};

    use super::*;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl StitchEngine for Counting {
        fn stitch(&self, frames: &FrameSequence, _: StitchOptions) -> StitchResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            if frames.is_empty() {
                return StitchResult::Failed;
            }
            StitchResult::Stitched(Arc::new(RgbImage::new(8, 2)))
        }
    }

    #[derive(Default)]
    struct MemorySink(Vec<String>);

    impl PanoramaSink for MemorySink {
        type Error = std::io::Error;

        fn persist(&mut self, _: &RgbImage, name: &str) -> Result<PathBuf, Self::Error> {
            self.0.push(name.to_owned());
            Ok(PathBuf::from(format!("{name}.png")))
        }
    }

    #[derive(Default)]
    struct Screen {
        shown: usize,
        failures: usize,
    }

    impl PanoramaView for Screen {
        fn show(&mut self, _: &RgbImage) {
            self.shown += 1;
        }

        fn show_failure(&mut self) {
            self.failures += 1;
        }
    }

    fn session_with(frames: usize) -> Session {
        let session = Session::new();
        for _ in 0..frames {
            session.append(Frame::new(RgbImage::new(4, 2)));
        }
        session
    }

    #[test]
    fn labels_follow_options() {
        let mut review = Review::new(session_with(2), Counting::default());
        assert_eq!(review.wave_correction_label(), "Wave Correction is On");
        assert_eq!(review.blender_label(), "Using Multiband Blending");
        review.toggle_wave_correction();
        review.toggle_blender();
        assert_eq!(review.wave_correction_label(), "Wave Correction is Off");
        assert_eq!(review.blender_label(), "Using Feather Blending");
    }

    #[test]
    fn repeated_render_uses_cache() {
        let engine = Arc::new(Counting::default());
        let mut review = Review::new(session_with(2), Arc::clone(&engine));
        review.render();
        review.render();
        assert_eq!(engine.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn new_frames_force_restitch() {
        let engine = Arc::new(Counting::default());
        let session = session_with(2);
        let mut review = Review::new(session.clone(), Arc::clone(&engine));
        review.render();
        session.append(Frame::new(RgbImage::new(4, 2)));
        review.render();
        assert_eq!(engine.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_goes_to_view() {
        let mut review = Review::new(Session::new(), Counting::default());
        let mut screen = Screen::default();
        assert!(!review.present(&mut screen).is_stitched());
        assert_eq!(screen.failures, 1);
        assert_eq!(screen.shown, 0);
    }

    #[test]
    fn save_names_with_timestamp() {
        let mut review = Review::new(session_with(2), Counting::default());
        let mut sink = MemorySink::default();
        assert!(matches!(review.save(&mut sink), Err(SessionError::NothingToSave)));
        review.render();
        let when = Local.with_ymd_and_hms(2023, 7, 1, 21, 30, 0).unwrap();
        let path = review.save_at(&mut sink, &when).unwrap();
        assert_eq!(sink.0, ["2023-07-01-09-30-00"]);
        assert_eq!(path, PathBuf::from("2023-07-01-09-30-00.png"));
    }

    #[test]
    fn failed_result_is_not_saved() {
        let mut review = Review::new(Session::new(), Counting::default());
        review.render();
        let mut sink = MemorySink::default();
        assert!(matches!(review.save(&mut sink), Err(SessionError::NothingToSave)));
        assert!(sink.0.is_empty());
    }
}
