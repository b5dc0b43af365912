//! Key-value store trait definition.

use crate::error::StorageResult;

/// A durable key-value slot for one client installation.
///
/// # Invariants
///
/// - `get` returns exactly the value most recently passed to `set` for a key
/// - `set` is durable once it returns `Ok`
/// - `remove` of a missing key is not an error
/// - Stores must be `Send + Sync`; the engine shares them behind an `Arc`
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be made durable.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be updated.
    fn remove(&self, key: &str) -> StorageResult<()>;
}
