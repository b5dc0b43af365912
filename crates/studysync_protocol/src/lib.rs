//! # studysync protocol
//!
//! Sync event types and the JSON wire codec shared by every studysync
//! device.
//!
//! This crate provides:
//! - [`SyncEvent`] and the [`EventPayload`] sum type, one variant per event kind
//! - [`Annotation`] items with stable ids
//! - [`Timestamp`], ISO-8601 strings whose lexical order is time order
//! - Frame decoding for live events and `catchup` batches
//!
//! Every frame on the channel has the same JSON shape:
//!
//! ```json
//! { "type": "sync:progress", "payload": { ... }, "deviceId": "...", "timestamp": "..." }
//! ```
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod timestamp;
mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    Annotation, AnnotationPayload, BookmarkPayload, EventPayload, PreferencesPayload,
    ProgressPayload, SyncEvent,
};
pub use timestamp::Timestamp;
pub use wire::{decode_frame, CatchupBatch, InboundFrame, WireMessage};

/// Wire type of progress events.
pub const PROGRESS_TYPE: &str = "sync:progress";
/// Wire type of bookmark events.
pub const BOOKMARKS_TYPE: &str = "sync:bookmarks";
/// Wire type of annotation events.
pub const ANNOTATIONS_TYPE: &str = "sync:annotations";
/// Wire type of preference events.
pub const PREFERENCES_TYPE: &str = "sync:preferences";
/// Reserved inbound type carrying events missed while disconnected.
pub const CATCHUP_TYPE: &str = "catchup";
