/// Errors raised by session-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The background stitch thread could not be started.
    #[error("failed to spawn stitch worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The background stitch thread has exited.
    #[error("stitch worker is no longer running")]
    WorkerGone,

    /// There is no stitched panorama to save.
    #[error("no panorama to save for the current options")]
    NothingToSave,

    /// The persistence collaborator failed.
    #[error("failed to persist panorama: {0}")]
    Persist(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors raised by the capture controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The sweep ended before the live source delivered any frame.
    #[error("no live frame has been delivered yet")]
    NoLiveFrame,
}
