//! Local publish/subscribe fan-out of sync notifications.

use crate::resolver::{Conflict, ConflictChoice};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use studysync_protocol::{Annotation, SyncEvent};
use tracing::error;

/// Notification name of a detected conflict.
pub const CONFLICT: &str = "conflict";
/// Notification name of a resolved conflict.
pub const CONFLICT_RESOLVED: &str = "conflict-resolved";
/// Notification name of a successful (re)connect.
pub const CONNECTED: &str = "connected";
/// Notification name of a dropped or closed channel.
pub const DISCONNECTED: &str = "disconnected";
/// Notification name of a scheduled reconnect.
pub const RECONNECTING: &str = "reconnecting";
/// Notification name of an auth rejection.
pub const AUTH_REJECTED: &str = "auth-rejected";
/// Notification name of a replayed catch-up batch.
pub const CATCHUP: &str = "catchup";
/// Subscribes to every notification.
pub const ANY: &str = "*";

/// Something local listeners can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    /// A sync event was accepted. Named after its wire type.
    Event(SyncEvent),
    /// A remote annotation collided with a local one.
    Conflict(Conflict),
    /// A conflict was resolved.
    ConflictResolved {
        /// The resolved conflict.
        conflict: Conflict,
        /// Which side won.
        choice: ConflictChoice,
        /// The version now in local state.
        version: Annotation,
    },
    /// The channel opened and the offline queue was flushed.
    Connected,
    /// The channel closed.
    Disconnected {
        /// Close code, if the channel reported one.
        code: Option<u16>,
        /// Close reason or error message.
        reason: String,
    },
    /// A reconnect was scheduled.
    Reconnecting {
        /// Retry number, starting at 1.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The server rejected the token; no automatic retry follows.
    AuthRejected,
    /// A catch-up batch was replayed.
    Catchup {
        /// Number of events in the batch.
        events: usize,
    },
}

impl SyncNotification {
    /// Returns the name subscribers register for.
    pub fn name(&self) -> &str {
        match self {
            SyncNotification::Event(event) => event.event_type(),
            SyncNotification::Conflict(_) => CONFLICT,
            SyncNotification::ConflictResolved { .. } => CONFLICT_RESOLVED,
            SyncNotification::Connected => CONNECTED,
            SyncNotification::Disconnected { .. } => DISCONNECTED,
            SyncNotification::Reconnecting { .. } => RECONNECTING,
            SyncNotification::AuthRejected => AUTH_REJECTED,
            SyncNotification::Catchup { .. } => CATCHUP,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SyncNotification) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    name: String,
    handler: Handler,
}

/// Synchronous fan-out to local subscribers.
///
/// - Delivery follows subscriber registration order
/// - A panicking subscriber is logged and skipped; the rest still run
/// - Handlers run outside the internal lock and may subscribe or
///   unsubscribe re-entrantly
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for notifications called `name` (or [`ANY`]).
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncNotification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            name: name.into(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes a subscription. Returns false if it was not registered under `name`.
    pub fn off(&self, name: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| !(s.id == id && s.name == name));
        subscribers.len() != before
    }

    /// Delivers a notification. Returns how many handlers completed.
    pub fn emit(&self, notification: &SyncNotification) -> usize {
        let name = notification.name();
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.name == name || s.name == ANY)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(notification))) {
                Ok(()) => delivered += 1,
                Err(cause) => {
                    let message = cause
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| cause.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(subscription = id.0, notification = name, panic = %message, "subscriber panicked");
                }
            }
        }
        delivered
    }

    /// Returns the number of handlers registered for `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.name == name)
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.on(CONNECTED, move |_| seen.lock().push(tag));
        }

        assert_eq!(bus.emit(&SyncNotification::Connected), 3);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn only_matching_names_are_called() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        bus.on(CONNECTED, move |n| s.lock().push(n.name().to_string()));
        let s = Arc::clone(&seen);
        bus.on(ANY, move |n| s.lock().push(format!("any:{}", n.name())));

        bus.emit(&SyncNotification::AuthRejected);
        bus.emit(&SyncNotification::Connected);

        assert_eq!(
            *seen.lock(),
            vec!["any:auth-rejected", "connected", "any:connected"]
        );
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        bus.on(CONNECTED, |_| panic!("listener bug"));
        let s = Arc::clone(&seen);
        bus.on(CONNECTED, move |_| *s.lock() += 1);

        assert_eq!(bus.emit(&SyncNotification::Connected), 1);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn off_removes_subscription() {
        let bus = EventBus::new();
        let id = bus.on(CONNECTED, |_| {});
        assert_eq!(bus.subscriber_count(CONNECTED), 1);

        assert!(!bus.off(DISCONNECTED, id));
        assert!(bus.off(CONNECTED, id));
        assert!(!bus.off(CONNECTED, id));
        assert_eq!(bus.emit(&SyncNotification::Connected), 0);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.on(CONNECTED, move |_| {
            inner.on(DISCONNECTED, |_| {});
        });

        bus.emit(&SyncNotification::Connected);
        assert_eq!(bus.subscriber_count(DISCONNECTED), 1);
    }
}
