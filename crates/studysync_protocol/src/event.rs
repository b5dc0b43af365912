//! Sync events and their typed payloads.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::Timestamp;
use crate::wire::WireMessage;
use crate::{ANNOTATIONS_TYPE, BOOKMARKS_TYPE, CATCHUP_TYPE, PREFERENCES_TYPE, PROGRESS_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Study progress for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// Case the progress belongs to.
    pub case_id: String,
    /// Application-defined progress document.
    pub data: Value,
}

/// Bookmark flag for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkPayload {
    /// Case the bookmark belongs to.
    pub case_id: String,
    /// Whether the case is bookmarked.
    pub bookmarked: bool,
}

/// A single annotation on an image.
///
/// The `id` is stable across devices; every other field is opaque to the
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Stable identifier shared by every device referencing this finding.
    pub id: String,
    /// Remaining annotation fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Annotation {
    /// Creates an annotation with no extra fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Adds a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// The annotation list for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPayload {
    /// Image the annotations belong to.
    pub image_id: String,
    /// Annotation items.
    pub annotations: Vec<Annotation>,
}

/// User preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesPayload {
    /// Preference document.
    pub preferences: Map<String, Value>,
}

/// Typed payload of a sync event, one variant per event kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `sync:progress`
    Progress(ProgressPayload),
    /// `sync:bookmarks`
    Bookmark(BookmarkPayload),
    /// `sync:annotations`
    Annotations(AnnotationPayload),
    /// `sync:preferences`
    Preferences(PreferencesPayload),
    /// Any other application-defined type.
    Custom {
        /// Wire type name.
        event_type: String,
        /// Untyped payload.
        payload: Value,
    },
}

impl EventPayload {
    /// Returns the wire type name.
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::Progress(_) => PROGRESS_TYPE,
            EventPayload::Bookmark(_) => BOOKMARKS_TYPE,
            EventPayload::Annotations(_) => ANNOTATIONS_TYPE,
            EventPayload::Preferences(_) => PREFERENCES_TYPE,
            EventPayload::Custom { event_type, .. } => event_type,
        }
    }

    /// Returns true for collection events whose items are checked for conflicts.
    pub fn is_structured(&self) -> bool {
        matches!(self, EventPayload::Annotations(_))
    }

    /// Builds a payload from its wire type and untyped JSON.
    pub fn from_parts(event_type: &str, payload: Value) -> ProtocolResult<Self> {
        Ok(match event_type {
            "" => return Err(ProtocolError::MissingField("type")),
            CATCHUP_TYPE => return Err(ProtocolError::ReservedType(event_type.to_string())),
            PROGRESS_TYPE => EventPayload::Progress(typed(event_type, payload)?),
            BOOKMARKS_TYPE => EventPayload::Bookmark(typed(event_type, payload)?),
            ANNOTATIONS_TYPE => EventPayload::Annotations(typed(event_type, payload)?),
            PREFERENCES_TYPE => EventPayload::Preferences(typed(event_type, payload)?),
            other => EventPayload::Custom {
                event_type: other.to_string(),
                payload,
            },
        })
    }

    /// Checks that a locally built payload can go out on the wire.
    ///
    /// A custom payload may not use an empty, reserved or built-in type
    /// name, since receivers would decode it as something else.
    pub fn validate(&self) -> ProtocolResult<()> {
        let EventPayload::Custom { event_type, .. } = self else {
            return Ok(());
        };
        match event_type.as_str() {
            "" => Err(ProtocolError::MissingField("type")),
            CATCHUP_TYPE | PROGRESS_TYPE | BOOKMARKS_TYPE | ANNOTATIONS_TYPE
            | PREFERENCES_TYPE => Err(ProtocolError::ReservedType(event_type.clone())),
            _ => Ok(()),
        }
    }

    /// Converts the payload to untyped JSON.
    pub fn to_value(&self) -> Value {
        let value = match self {
            EventPayload::Progress(p) => serde_json::to_value(p),
            EventPayload::Bookmark(p) => serde_json::to_value(p),
            EventPayload::Annotations(p) => serde_json::to_value(p),
            EventPayload::Preferences(p) => serde_json::to_value(p),
            EventPayload::Custom { payload, .. } => return payload.clone(),
        };
        // Plain derived structs with string keys always serialize.
        value.unwrap_or(Value::Null)
    }
}

fn typed<T: DeserializeOwned>(event_type: &str, payload: Value) -> ProtocolResult<T> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        event_type: event_type.to_string(),
        message: e.to_string(),
    })
}

/// A sync event as produced by one device and delivered to the others.
///
/// Serializes to the wire shape `{ type, payload, deviceId, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct SyncEvent {
    /// Typed payload.
    pub payload: EventPayload,
    /// Originating device.
    pub device_id: String,
    /// Generation time on the originating device.
    pub timestamp: Timestamp,
}

impl SyncEvent {
    /// Creates an event.
    pub fn new(payload: EventPayload, device_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            payload,
            device_id: device_id.into(),
            timestamp,
        }
    }

    /// Returns the wire type name.
    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    /// Encodes the event as a JSON text frame.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a single event from a JSON text frame.
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        let wire: WireMessage = serde_json::from_str(text)?;
        SyncEvent::try_from(wire)
    }
}

impl TryFrom<WireMessage> for SyncEvent {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> ProtocolResult<Self> {
        if wire.device_id.is_empty() {
            return Err(ProtocolError::MissingField("deviceId"));
        }
        if wire.timestamp.is_empty() {
            return Err(ProtocolError::MissingField("timestamp"));
        }
        let payload = EventPayload::from_parts(&wire.event_type, wire.payload)?;
        let timestamp = Timestamp::parse(&wire.timestamp)?;
        Ok(Self {
            payload,
            device_id: wire.device_id,
            timestamp,
        })
    }
}

impl From<SyncEvent> for WireMessage {
    fn from(event: SyncEvent) -> Self {
        Self {
            event_type: event.payload.event_type().to_string(),
            payload: event.payload.to_value(),
            device_id: event.device_id,
            timestamp: event.timestamp.as_str().to_string(),
        }
    }
}
