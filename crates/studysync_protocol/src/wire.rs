//! Raw frames and inbound frame decoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::SyncEvent;
use crate::CATCHUP_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The untyped message shape shared by every frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Wire type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
    /// Originating device. Server-generated frames may omit it.
    #[serde(default)]
    pub device_id: String,
    /// Generation time. Server-generated frames may omit it.
    #[serde(default)]
    pub timestamp: String,
}

/// Payload of a `catchup` frame.
///
/// Entries are kept untyped so that one malformed entry does not poison
/// the rest of the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchupBatch {
    /// Missed events, oldest first.
    pub events: Vec<WireMessage>,
}

impl CatchupBatch {
    /// Decodes every entry, in order.
    pub fn decode(self) -> impl Iterator<Item = ProtocolResult<SyncEvent>> {
        self.events.into_iter().map(SyncEvent::try_from)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A live sync event.
    Event(SyncEvent),
    /// Events missed while disconnected.
    Catchup(CatchupBatch),
}

/// Decodes a text frame received from the channel.
pub fn decode_frame(text: &str) -> ProtocolResult<InboundFrame> {
    let wire: WireMessage = serde_json::from_str(text)?;
    if wire.event_type == CATCHUP_TYPE {
        let batch: CatchupBatch =
            serde_json::from_value(wire.payload).map_err(|e| ProtocolError::InvalidPayload {
                event_type: CATCHUP_TYPE.to_string(),
                message: e.to_string(),
            })?;
        return Ok(InboundFrame::Catchup(batch));
    }
    SyncEvent::try_from(wire).map(InboundFrame::Event)
}
