//! # studysync storage
//!
//! Key-value persistence port for the studysync engine.
//!
//! The engine persists two things locally: the stable device identifier and
//! the ordered offline queue of outbound events. Both live in a small
//! per-installation key-value slot. Stores are **opaque string stores**;
//! they never interpret the values they hold.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - One file per key inside a directory
//!
//! ## Example
//!
//! ```rust
//! use studysync_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.set("device", "abc").unwrap();
//! assert_eq!(store.get("device").unwrap().as_deref(), Some("abc"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::KeyValueStore;
