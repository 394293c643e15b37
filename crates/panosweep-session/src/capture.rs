//! Timed frame sampling from a live source.
//!
//! The controller is a two-state machine driven by the capture thread:
//! every delivered frame goes through [`CaptureController::tick`], and
//! while capturing a frame is kept once per interval. Ending the sweep
//! always keeps the latest frame so the end of the sweep is covered.
//!
//! ```text
//!            toggle_on                     toggle_off
//!   Idle ───────────────▶ Capturing ───────────────────▶ Idle
//!   (accumulated = interval)   │  tick: accumulated += dt
//!                              │  keep frame when accumulated >= interval
//! ```

use std::time::Duration;

use panosweep_stitch::{Frame, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CaptureError;
use crate::session::Session;

/// Where kept frames go.
pub trait FrameSink {
    /// Store `frame`, returning how many frames are now held.
    fn push(&mut self, frame: Frame) -> usize;

    /// Drop every stored frame.
    fn clear(&mut self);
}

impl FrameSink for Session {
    fn push(&mut self, frame: Frame) -> usize {
        self.append(frame)
    }

    fn clear(&mut self) {
        self.reset();
    }
}

impl FrameSink for Vec<Frame> {
    fn push(&mut self, frame: Frame) -> usize {
        Self::push(self, frame);
        self.len()
    }

    fn clear(&mut self) {
        Self::clear(self);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
}

/// Preset capture intervals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureRate {
    /// Two frames per second.
    Fast,
    /// One frame per second.
    #[default]
    Normal,
    /// One frame every two seconds.
    Slow,
}

impl CaptureRate {
    pub const ALL: [Self; 3] = [Self::Fast, Self::Normal, Self::Slow];

    #[must_use]
    pub const fn interval(self) -> Duration {
        match self {
            Self::Fast => Duration::from_millis(500),
            Self::Normal => Duration::from_millis(1000),
            Self::Slow => Duration::from_millis(2000),
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Fast => "2 frames per second",
            Self::Normal => "1 frame per second",
            Self::Slow => "1 frame per 2 seconds",
        }
    }
}

impl From<CaptureRate> for Duration {
    fn from(rate: CaptureRate) -> Self {
        rate.interval()
    }
}

/// One delivery from the live source.
#[derive(Debug, Clone)]
pub struct LiveFrame {
    pub image: RgbImage,
    /// Time since the previous delivery.
    pub elapsed: Duration,
}

impl LiveFrame {
    #[must_use]
    pub const fn new(image: RgbImage, elapsed: Duration) -> Self {
        Self { image, elapsed }
    }
}

/// Something the caller should react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A frame was kept; `count` frames are now held.
    FrameCaptured { count: usize },
    /// Capturing stopped with `count` frames held; stitching can start.
    SweepFinished { count: usize },
}

#[derive(Debug)]
pub struct CaptureController<S> {
    sink: S,
    state: CaptureState,
    interval: Duration,
    accumulated: Duration,
    latest: Option<Frame>,
}

impl<S: FrameSink> CaptureController<S> {
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self::with_interval(sink, CaptureRate::default().interval())
    }

    #[must_use]
    pub const fn with_interval(sink: S, interval: Duration) -> Self {
        Self {
            sink,
            state: CaptureState::Idle,
            interval,
            accumulated: interval,
            latest: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> CaptureState {
        self.state
    }

    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        matches!(self.state, CaptureState::Capturing)
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Time accumulated towards the next kept frame.
    #[must_use]
    pub const fn accumulated(&self) -> Duration {
        self.accumulated
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Change the interval. Accumulated progress is kept.
    pub fn set_interval(&mut self, interval: impl Into<Duration>) {
        self.interval = interval.into();
        debug!(interval_ms = self.interval.as_millis(), "capture interval changed");
    }

    /// Start capturing. The next tick keeps its frame.
    pub fn toggle_on(&mut self) {
        if self.is_capturing() {
            return;
        }
        self.accumulated = self.interval;
        self.state = CaptureState::Capturing;
        info!("capturing started");
    }

    /// Stop capturing and keep the latest live frame.
    ///
    /// Returns `Ok(None)` if capture was already idle.
    ///
    /// # Errors
    ///
    /// [`CaptureError::NoLiveFrame`] if no frame was ever delivered. The
    /// controller is idle afterwards either way.
    pub fn toggle_off(&mut self) -> Result<Option<CaptureEvent>, CaptureError> {
        if !self.is_capturing() {
            return Ok(None);
        }
        self.state = CaptureState::Idle;
        self.accumulated = Duration::ZERO;
        let frame = self.latest.clone().ok_or(CaptureError::NoLiveFrame)?;
        let count = self.sink.push(frame);
        info!(frames = count, "capturing ended");
        Ok(Some(CaptureEvent::SweepFinished { count }))
    }

    /// Feed one live frame.
    pub fn tick(&mut self, live: LiveFrame) -> Option<CaptureEvent> {
        let frame = Frame::new(live.image);
        self.latest = Some(frame.clone());
        if !self.is_capturing() {
            return None;
        }
        self.accumulated += live.elapsed;
        if self.accumulated < self.interval {
            return None;
        }
        self.accumulated = Duration::ZERO;
        let count = self.sink.push(frame);
        Some(CaptureEvent::FrameCaptured { count })
    }

    /// The live source has (re)started: start a fresh capture session.
    pub fn source_started(&mut self) {
        self.sink.clear();
        self.accumulated = self.interval;
        debug!("live source started");
    }

    /// The live source has stopped. Any sweep in progress is abandoned.
    pub fn source_stopped(&mut self) {
        self.state = CaptureState::Idle;
        self.accumulated = Duration::ZERO;
        debug!("live source stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn live(ms: u64) -> LiveFrame {
        LiveFrame::new(RgbImage::new(4, 3), Duration::from_millis(ms))
    }

    fn controller() -> CaptureController<Vec<Frame>> {
        CaptureController::new(Vec::new())
    }

    #[test]
    fn first_tick_after_toggle_on_captures() {
        let mut c = controller();
        c.toggle_on();
        assert_eq!(c.tick(live(0)), Some(CaptureEvent::FrameCaptured { count: 1 }));
        assert_eq!(c.sink().len(), 1);
    }

    #[test]
    fn idle_ticks_capture_nothing() {
        let mut c = controller();
        for _ in 0..5 {
            assert_eq!(c.tick(live(2000)), None);
        }
        assert!(c.sink().is_empty());
    }

    #[test]
    fn frames_are_kept_once_per_interval() {
        let mut c = controller();
        c.toggle_on();
        c.tick(live(0));
        let kept = (0..10).filter_map(|_| c.tick(live(250))).count();
        // 2500 ms at 1000 ms per frame.
        assert_eq!(kept, 2);
        assert_eq!(c.sink().len(), 3);
        assert_eq!(c.accumulated(), Duration::from_millis(500));
    }

    #[test]
    fn toggle_off_always_keeps_one_frame() {
        let mut c = controller();
        c.toggle_on();
        c.tick(live(0));
        c.tick(live(10));
        let event = c.toggle_off().unwrap();
        assert_eq!(event, Some(CaptureEvent::SweepFinished { count: 2 }));
        assert_eq!(c.state(), CaptureState::Idle);
        assert_eq!(c.accumulated(), Duration::ZERO);
    }

    #[test]
    fn toggle_off_without_live_frame_fails() {
        let mut c = controller();
        c.toggle_on();
        assert_eq!(c.toggle_off(), Err(CaptureError::NoLiveFrame));
        assert!(!c.is_capturing());
        assert!(c.sink().is_empty());
    }

    #[test]
    fn redundant_toggles_are_ignored() {
        let mut c = controller();
        assert_eq!(c.toggle_off(), Ok(None));
        c.toggle_on();
        c.tick(live(0));
        c.tick(live(400));
        c.toggle_on();
        // Progress was not reset by the second toggle_on.
        assert_eq!(c.accumulated(), Duration::from_millis(400));
        assert_eq!(c.sink().len(), 1);
    }

    #[test]
    fn interval_change_keeps_progress() {
        let mut c = controller();
        c.toggle_on();
        c.tick(live(0));
        c.tick(live(400));
        c.set_interval(CaptureRate::Fast);
        assert_eq!(c.tick(live(100)), Some(CaptureEvent::FrameCaptured { count: 2 }));
    }

    #[test]
    fn source_restart_starts_fresh() {
        let mut c = controller();
        c.toggle_on();
        c.tick(live(0));
        c.source_stopped();
        assert!(!c.is_capturing());
        c.source_started();
        assert!(c.sink().is_empty());
        assert_eq!(c.accumulated(), c.interval());
    }

    #[test]
    fn session_is_a_sink() {
        let session = Session::new();
        let mut c = CaptureController::with_interval(session.clone(), Duration::from_millis(500));
        c.toggle_on();
        c.tick(live(0));
        c.tick(live(500));
        c.toggle_off().unwrap();
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn presets_match_menu() {
        let ms: Vec<u128> = CaptureRate::ALL.iter().map(|r| r.interval().as_millis()).collect();
        assert_eq!(ms, [500, 1000, 2000]);
        assert_eq!(CaptureRate::default().label(), "1 frame per second");
    }
}
