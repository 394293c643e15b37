//! panosweep-session: the state around the stitching engine.
//!
//! A [`Session`] owns the frames of one sweep together with the cached
//! stitch result for each [`StitchOptions`](panosweep_stitch::StitchOptions)
//! value. The [`CaptureController`] fills it from a live source, a
//! [`StitchWorker`] stitches it off the capture thread, and a [`Review`]
//! walks the quality toggles without recomputing anything already seen.

pub mod accumulator;
pub mod cache;
pub mod capture;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod review;
pub mod session;
pub mod worker;

pub use accumulator::FrameAccumulator;
pub use cache::ResultCache;
pub use capture::{CaptureController, CaptureEvent, CaptureRate, CaptureState, FrameSink, LiveFrame};
pub use collaborators::{FAILURE_MESSAGE, PanoramaSink, PanoramaView, suggested_name};
pub use engine::{StitchEngine, Stitcher};
pub use error::{CaptureError, SessionError};
pub use review::Review;
pub use session::{Session, Snapshot};
pub use worker::{StitchReply, StitchRequest, StitchWorker};
