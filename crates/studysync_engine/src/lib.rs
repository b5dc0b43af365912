//! # studysync engine
//!
//! Client-resident sync engine keeping per-device learning state (study
//! progress, bookmarks, image annotations, preferences) consistent across
//! concurrently active sessions of the same account.
//!
//! This crate provides:
//! - Stable device identity
//! - A durable offline queue of outbound events
//! - A local notification bus
//! - Last-write-wins application of scalar events and conflict surfacing for
//!   annotations
//! - A connection state machine with exponential-backoff reconnects and
//!   catch-up replay
//! - A single-task tokio dispatch loop
//!
//! ## Architecture
//!
//! ```text
//! SyncClient::send ──► ConnectionManager ──► SyncChannel (open)
//!                              │
//!                              └──────────► OfflineQueue (closed)
//!
//! ChannelEvent ──► ConnectionManager ──► ConflictResolver ──► EventBus
//! ```
//!
//! ## Key Invariants
//!
//! - Every outbound event carries the local device id and its generation time
//! - Events sent by this device are never reapplied
//! - The per-key timestamp index only moves forward
//! - Every annotation id collision is surfaced as exactly one conflict
//! - Queued events leave in FIFO order, each exactly once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod channel;
mod client;
mod clock;
mod config;
mod connection;
mod device;
mod error;
mod queue;
mod resolver;
mod runtime;

pub use bus::{
    EventBus, SubscriptionId, SyncNotification, ANY, AUTH_REJECTED, CATCHUP, CONFLICT,
    CONFLICT_RESOLVED, CONNECTED, DISCONNECTED, RECONNECTING,
};
pub use channel::{
    ChannelEvent, ChannelTarget, MockChannel, SyncChannel, ABNORMAL_CLOSE, NORMAL_CLOSE,
};
pub use client::SyncClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    RetryConfig, SyncConfig, DEFAULT_AUTH_REJECTED_CLOSE_CODE, DEFAULT_DEVICE_KEY,
    DEFAULT_QUEUE_KEY,
};
pub use connection::{
    ConnectionManager, ConnectionSignal, ConnectionState, ConnectionStats, ScheduledRetry,
};
pub use device::DeviceId;
pub use error::{SyncError, SyncResult};
pub use queue::{FlushOutcome, OfflineQueue};
pub use resolver::{
    Conflict, ConflictChoice, ConflictResolver, Disposition, ImageAnnotations, Resolution,
};
pub use runtime::{SyncHandle, SyncRuntime};
