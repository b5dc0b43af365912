//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key cannot be mapped onto the backing medium.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// The stored value is not valid UTF-8.
    #[error("stored value for {key:?} is not valid UTF-8")]
    NotUtf8 {
        /// The key whose value was unreadable.
        key: String,
    },

    /// The store refused the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}
