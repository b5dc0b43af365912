//! Stable per-installation device identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use studysync_storage::KeyValueStore;
use tracing::{info, warn};
use uuid::Uuid;

/// Opaque identifier of one client installation.
///
/// Generated once, persisted, and reused for the lifetime of the
/// installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Loads the persisted identifier, creating and persisting one if absent.
    ///
    /// Never fails. An unreadable slot is treated as empty; if the new id
    /// cannot be persisted it is still used for this session.
    pub fn load_or_create(store: &dyn KeyValueStore, key: &str) -> Self {
        match store.get(key) {
            Ok(Some(id)) if !id.trim().is_empty() => return Self(id),
            Ok(_) => {}
            Err(e) => warn!(error = %e, key, "device id unreadable, generating a new one"),
        }

        let id = Self::generate();
        match store.set(key, id.as_str()) {
            Ok(()) => info!(device_id = %id, "generated device id"),
            Err(e) => warn!(error = %e, device_id = %id, "device id not persisted"),
        }
        id
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
