//! Classification of incoming events: apply, discard as stale, or flag a conflict.

use crate::bus::{EventBus, SyncNotification};
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use studysync_protocol::{Annotation, AnnotationPayload, EventPayload, SyncEvent, Timestamp};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scalar key of preference events; there is one preference document per user.
const PREFERENCES_KEY: &str = "preferences";

/// Which side of a conflict to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    /// Keep the local version and push it to the other devices.
    Local,
    /// Accept the remote version.
    Remote,
}

/// A remote annotation whose id collided with a locally tracked one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Conflict id, unique per detection.
    pub id: String,
    /// Wire type of the event that caused it.
    pub event_type: String,
    /// Image the annotation belongs to.
    pub image_id: String,
    /// Id of the colliding annotation.
    pub annotation_id: String,
    /// Local version at detection time.
    pub local_version: Annotation,
    /// Incoming version.
    pub remote_version: Annotation,
    /// Device that sent the incoming version.
    pub remote_device_id: String,
    /// Timestamp of the incoming event.
    pub timestamp: Timestamp,
}

/// Locally tracked annotations of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnnotations {
    /// Current annotation items.
    pub annotations: Vec<Annotation>,
    /// Time of the last local change.
    pub timestamp: Timestamp,
}

impl ImageAnnotations {
    fn splice(&mut self, item: Annotation) {
        match self.annotations.iter_mut().find(|a| a.id == item.id) {
            Some(slot) => *slot = item,
            None => self.annotations.push(item),
        }
    }
}

/// What happened to an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sent by this device; ignored.
    SelfOrigin,
    /// Scalar event not newer than the indexed timestamp; dropped silently.
    Stale,
    /// Applied and emitted.
    Applied,
    /// Structured event emitted with this many conflicts recorded.
    Conflicted(usize),
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The conflict that was removed.
    pub conflict: Conflict,
    /// The version now in local state.
    pub chosen: Annotation,
    /// Payload to send outward so other devices converge, if any.
    pub outbound: Option<EventPayload>,
}

/// Applies incoming events against locally tracked state.
///
/// # Invariants
///
/// - Events whose device id is the local one are never applied
/// - The timestamp index for a key only moves forward
/// - Every annotation id collision records exactly one conflict
/// - A conflict is removed exactly once, by [`ConflictResolver::resolve`]
pub struct ConflictResolver {
    device_id: String,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    last_timestamps: HashMap<String, Timestamp>,
    annotations: HashMap<String, ImageAnnotations>,
    conflicts: Vec<Conflict>,
}

impl ConflictResolver {
    /// Creates a resolver for the local device.
    pub fn new(device_id: impl Into<String>, clock: Arc<dyn Clock>, bus: Arc<EventBus>) -> Self {
        Self {
            device_id: device_id.into(),
            clock,
            bus,
            last_timestamps: HashMap::new(),
            annotations: HashMap::new(),
            conflicts: Vec::new(),
        }
    }

    /// Classifies and applies one incoming event.
    pub fn apply(&mut self, event: SyncEvent) -> Disposition {
        if event.device_id == self.device_id {
            debug!(event_type = event.event_type(), "ignoring self-originated event");
            return Disposition::SelfOrigin;
        }
        match &event.payload {
            EventPayload::Annotations(payload) => {
                let found = self.detect_conflicts(payload, &event);
                self.bus.emit(&SyncNotification::Event(event));
                Disposition::Conflicted(found)
            }
            _ => {
                let key = scalar_key(&event.payload);
                if !self.advance(key, &event.timestamp) {
                    debug!(event_type = event.event_type(), timestamp = %event.timestamp, "discarding stale event");
                    return Disposition::Stale;
                }
                self.bus.emit(&SyncNotification::Event(event));
                Disposition::Applied
            }
        }
    }

    /// Records an event this device is sending, so remote edits are judged against it.
    pub fn record_local(&mut self, event: &SyncEvent) {
        match &event.payload {
            EventPayload::Annotations(payload) => {
                let state = self.image_state(&payload.image_id, &event.timestamp);
                for item in &payload.annotations {
                    state.splice(item.clone());
                }
                state.timestamp = event.timestamp.clone();
            }
            other => {
                let key = scalar_key(other);
                self.advance(key, &event.timestamp);
            }
        }
    }

    /// Resolves an open conflict.
    ///
    /// An unknown id changes nothing and returns [`SyncError::UnknownConflict`].
    pub fn resolve(&mut self, conflict_id: &str, choice: ConflictChoice) -> SyncResult<Resolution> {
        let Some(position) = self.conflicts.iter().position(|c| c.id == conflict_id) else {
            warn!(conflict_id, "resolve requested for unknown conflict");
            return Err(SyncError::UnknownConflict {
                conflict_id: conflict_id.to_string(),
            });
        };
        let conflict = self.conflicts.remove(position);
        let chosen = match choice {
            ConflictChoice::Local => conflict.local_version.clone(),
            ConflictChoice::Remote => conflict.remote_version.clone(),
        };

        let now = self.clock.now();
        let state = self.image_state(&conflict.image_id, &now);
        state.splice(chosen.clone());
        state.timestamp = now;

        info!(conflict_id, ?choice, image_id = %conflict.image_id, "conflict resolved");
        self.bus.emit(&SyncNotification::ConflictResolved {
            conflict: conflict.clone(),
            choice,
            version: chosen.clone(),
        });

        let outbound = match choice {
            ConflictChoice::Local => Some(EventPayload::Annotations(AnnotationPayload {
                image_id: conflict.image_id.clone(),
                annotations: vec![chosen.clone()],
            })),
            ConflictChoice::Remote => None,
        };
        Ok(Resolution {
            conflict,
            chosen,
            outbound,
        })
    }

    /// Returns a snapshot of the unresolved conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.clone()
    }

    /// Returns the tracked annotations of an image.
    pub fn annotations_for(&self, image_id: &str) -> Option<&ImageAnnotations> {
        self.annotations.get(image_id)
    }

    /// Returns the indexed timestamp of a scalar key such as `sync:progress:case-1`.
    pub fn last_timestamp(&self, key: &str) -> Option<&Timestamp> {
        self.last_timestamps.get(key)
    }

    fn detect_conflicts(&mut self, payload: &AnnotationPayload, event: &SyncEvent) -> usize {
        let mut found = Vec::new();
        let state = self.image_state(&payload.image_id, &event.timestamp);
        for item in &payload.annotations {
            let existing = state.annotations.iter().find(|a| a.id == item.id).cloned();
            match existing {
                Some(local) => found.push(Conflict {
                    id: Uuid::new_v4().to_string(),
                    event_type: event.event_type().to_string(),
                    image_id: payload.image_id.clone(),
                    annotation_id: item.id.clone(),
                    local_version: local,
                    remote_version: item.clone(),
                    remote_device_id: event.device_id.clone(),
                    timestamp: event.timestamp.clone(),
                }),
                None => {
                    state.annotations.push(item.clone());
                    state.timestamp = event.timestamp.clone();
                }
            }
        }

        let count = found.len();
        for conflict in found {
            info!(
                conflict_id = %conflict.id,
                image_id = %conflict.image_id,
                annotation_id = %conflict.annotation_id,
                remote_device_id = %conflict.remote_device_id,
                "annotation conflict detected"
            );
            self.conflicts.push(conflict.clone());
            self.bus.emit(&SyncNotification::Conflict(conflict));
        }
        count
    }

    fn image_state(&mut self, image_id: &str, timestamp: &Timestamp) -> &mut ImageAnnotations {
        self.annotations
            .entry(image_id.to_string())
            .or_insert_with(|| ImageAnnotations {
                annotations: Vec::new(),
                timestamp: timestamp.clone(),
            })
    }

    /// Moves the index for `key` to `timestamp` if strictly newer.
    fn advance(&mut self, key: String, timestamp: &Timestamp) -> bool {
        match self.last_timestamps.get(&key) {
            Some(current) if timestamp <= current => false,
            _ => {
                self.last_timestamps.insert(key, timestamp.clone());
                true
            }
        }
    }
}

/// Composite `type:key` index key of a scalar event.
fn scalar_key(payload: &EventPayload) -> String {
    let key = match payload {
        EventPayload::Progress(p) => p.case_id.as_str(),
        EventPayload::Bookmark(p) => p.case_id.as_str(),
        EventPayload::Preferences(_) => PREFERENCES_KEY,
        EventPayload::Custom { payload, .. } => {
            payload.get("key").and_then(|k| k.as_str()).unwrap_or("")
        }
        EventPayload::Annotations(p) => p.image_id.as_str(),
    };
    format!("{}:{}", payload.event_type(), key)
}
