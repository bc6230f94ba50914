//! Error taxonomy for sync operations.
//!
//! `Conflict` is deliberately absent: an unresolved conflict is a valid
//! document state, reported as data, never as an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Retryable network failure (timeouts, 5xx, rate limiting).
    /// Retried with exponential backoff up to the configured ceiling.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Authentication/authorization failure. Fatal, surfaced immediately.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The document no longer exists remotely. Triggers tombstone
    /// handling rather than a retry.
    #[error("remote document not found: {0}")]
    RemoteNotFound(String),

    /// The persisted state store cannot be read. The engine refuses to
    /// proceed rather than guess at prior state.
    #[error("corrupt state store: {0}")]
    CorruptState(String),

    /// Retry ceiling exhausted for an operation on a document.
    #[error("retries exhausted for {operation} on document {id}")]
    RetriesExhausted { operation: String, id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Whether the operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
