//! Background stitching on a dedicated thread.
//!
//! [`StitchWorker`] owns one thread that runs a [`StitchEngine`] for each
//! request it receives over a channel. Every request carries the session
//! epoch its frames were taken at and the reply echoes it back, so a reply
//! that arrives after the frames changed is recognised as stale and never
//! cached. There is no cancellation; a caller that no longer wants a result
//! simply ignores it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use panosweep_stitch::{FrameSequence, StitchOptions, StitchResult};
use tracing::{debug, warn};

use crate::engine::StitchEngine;
use crate::error::SessionError;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct StitchRequest {
    pub frames: FrameSequence,
    pub options: StitchOptions,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct StitchReply {
    pub options: StitchOptions,
    pub epoch: u64,
    pub result: StitchResult,
}

#[derive(Debug)]
enum WorkerMessage {
    Exit,
    Stitch(StitchRequest),
}

#[derive(Debug)]
pub struct StitchWorker {
    thread_handle: Option<JoinHandle<()>>,
    tx: Sender<WorkerMessage>,
    rx: Receiver<StitchReply>,
}

impl StitchWorker {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// [`SessionError::Spawn`] if the OS refuses to create the thread.
    pub fn new<E>(engine: E) -> Result<Self, SessionError>
    where
        E: StitchEngine + 'static,
    {
        let (tx, worker_rx) = mpsc::channel::<WorkerMessage>();
        let (reply_tx, rx) = mpsc::channel::<StitchReply>();

        let thread_handle = thread::Builder::new()
            .name("panosweep-stitch".into())
            .spawn(move || Self::worker_loop(&engine, &worker_rx, &reply_tx))
            .map_err(SessionError::Spawn)?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            tx,
            rx,
        })
    }

    fn worker_loop(
        engine: &impl StitchEngine,
        rx: &Receiver<WorkerMessage>,
        tx: &Sender<StitchReply>,
    ) {
        // A closed request channel means the worker handle is gone.
        while let Ok(message) = rx.recv() {
            match message {
                WorkerMessage::Exit => break,
                WorkerMessage::Stitch(request) => {
                    debug!(
                        frames = request.frames.len(),
                        epoch = request.epoch,
                        options = ?request.options,
                        "stitching in background"
                    );
                    let result = engine.stitch(&request.frames, request.options);
                    let reply = StitchReply {
                        options: request.options,
                        epoch: request.epoch,
                        result,
                    };
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Queue a request.
    ///
    /// # Errors
    ///
    /// [`SessionError::WorkerGone`] if the worker thread has exited.
    pub fn submit(&self, request: StitchRequest) -> Result<(), SessionError> {
        self.tx
            .send(WorkerMessage::Stitch(request))
            .map_err(|_| SessionError::WorkerGone)
    }

    /// Queue a stitch of the session's current frames.
    ///
    /// # Errors
    ///
    /// [`SessionError::WorkerGone`] if the worker thread has exited.
    pub fn request(&self, session: &Session, options: StitchOptions) -> Result<u64, SessionError> {
        let snapshot = session.snapshot();
        let epoch = snapshot.epoch;
        self.submit(StitchRequest {
            frames: snapshot.frames,
            options,
            epoch,
        })?;
        Ok(epoch)
    }

    /// Block until the next reply arrives.
    ///
    /// # Errors
    ///
    /// [`SessionError::WorkerGone`] if the worker thread has exited.
    pub fn recv(&self) -> Result<StitchReply, SessionError> {
        self.rx.recv().map_err(|_| SessionError::WorkerGone)
    }

    /// Block for at most `timeout`. `Ok(None)` means nothing arrived.
    ///
    /// # Errors
    ///
    /// [`SessionError::WorkerGone`] if the worker thread has exited.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<StitchReply>, SessionError> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::WorkerGone),
        }
    }

    /// Poll for a reply without blocking.
    ///
    /// # Errors
    ///
    /// [`SessionError::WorkerGone`] if the worker thread has exited.
    pub fn try_recv(&self) -> Result<Option<StitchReply>, SessionError> {
        match self.rx.try_recv() {
            Ok(reply) => Ok(Some(reply)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SessionError::WorkerGone),
        }
    }
}

impl StitchReply {
    /// Cache this reply in `session` unless its frames are stale.
    pub fn deliver(self, session: &Session) -> bool {
        session.store(self.epoch, self.options, self.result)
    }
}

impl Drop for StitchWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Exit);
        if let Some(handle) = self.thread_handle.take()
            && handle.join().is_err()
        {
            warn!("stitch worker thread panicked");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use panosweep_stitch::{Frame, RgbImage};

    /// Returns a 1-pixel panorama whose width is the frame count.
    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl StitchEngine for Counting {
        fn stitch(&self, frames: &FrameSequence, _: StitchOptions) -> StitchResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            let width = u32::try_from(frames.len().max(1)).unwrap();
            StitchResult::Stitched(Arc::new(RgbImage::new(width, 1)))
        }
    }

    fn session_with(frames: usize) -> Session {
        let session = Session::new();
        for _ in 0..frames {
            session.append(Frame::new(RgbImage::new(2, 2)));
        }
        session
    }

    #[test]
    fn replies_echo_request() {
        let worker = StitchWorker::new(Counting::default()).unwrap();
        let session = session_with(3);
        let epoch = worker.request(&session, StitchOptions::new(false, true)).unwrap();
        let reply = worker.recv().unwrap();
        assert_eq!(reply.epoch, epoch);
        assert_eq!(reply.options, StitchOptions::new(false, true));
        assert_eq!(reply.result.panorama().unwrap().width(), 3);
        assert!(reply.deliver(&session));
        assert!(session.cached(StitchOptions::new(false, true)).is_some());
    }

    #[test]
    fn stale_replies_are_not_cached() {
        let engine = Arc::new(Counting::default());
        let worker = StitchWorker::new(Arc::clone(&engine)).unwrap();
        let session = session_with(2);
        worker.request(&session, StitchOptions::default()).unwrap();
        session.append(Frame::new(RgbImage::new(2, 2)));
        let reply = worker.recv().unwrap();
        assert!(!reply.deliver(&session));
        assert!(session.cached(StitchOptions::default()).is_none());
        assert_eq!(engine.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requests_are_answered_in_order() {
        let worker = StitchWorker::new(Counting::default()).unwrap();
        let session = session_with(2);
        for options in StitchOptions::ALL {
            worker.request(&session, options).unwrap();
        }
        let order: Vec<_> = (0..4).map(|_| worker.recv().unwrap().options).collect();
        assert_eq!(order, StitchOptions::ALL);
    }

    #[test]
    fn empty_poll_is_not_an_error() {
        let worker = StitchWorker::new(Counting::default()).unwrap();
        assert!(worker.try_recv().unwrap().is_none());
        assert!(worker.recv_timeout(Duration::from_millis(1)).unwrap().is_none());
    }
}
