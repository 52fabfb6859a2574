use thiserror::Error;

/// Errors surfaced by the backend seam.
///
/// `Rejected` is terminal for the operation that provoked it (authorization
/// denial, constraint violation) and is never retried. Everything else is a
/// transport-level condition the channel layer recovers from with backoff.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Engine-surface errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("channel failed after {attempts} reconnect attempts")]
    ChannelFailed { attempts: u32 },
    #[error("mutation rejected: {0}")]
    MutationRejected(String),
    #[error("unknown record: {0}")]
    UnknownRecord(String),
    #[error("patch does not match record shape: {0}")]
    InvalidPatch(String),
    #[error("mutation outcome unavailable: issuing side shut down")]
    OutcomeLost,
}
