//! Error types for the sync engine.

use studysync_protocol::ProtocolError;
use studysync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these cross the public API as a panic. Channel failures are
/// recovered by the reconnect policy; everything else is logged and
/// returned as a value.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The channel failed to open or dropped.
    #[error("connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// The server closed the channel with the auth-rejection code.
    #[error("authentication rejected")]
    AuthRejected,

    /// An inbound frame could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    /// The offline queue could not be written to durable storage.
    #[error("offline queue persistence failed: {0}")]
    QueuePersistence(#[source] StorageError),

    /// No open conflict has the given id.
    #[error("unknown conflict: {conflict_id}")]
    UnknownConflict {
        /// The id that was looked up.
        conflict_id: String,
    },

    /// The configured endpoint is not a valid URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The dispatch loop is no longer running.
    #[error("sync runtime stopped")]
    RuntimeStopped,
}

impl SyncError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Returns true if the reconnect policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connection { .. })
    }
}
