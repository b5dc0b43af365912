//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not have the message shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is missing or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The payload does not match the shape required by its type.
    #[error("invalid payload for {event_type}: {message}")]
    InvalidPayload {
        /// Wire type of the offending message.
        event_type: String,
        /// Decoder message.
        message: String,
    },

    /// The timestamp is not an ISO-8601 instant.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// A reserved type was used where a sync event was expected.
    #[error("reserved message type: {0}")]
    ReservedType(String),
}
