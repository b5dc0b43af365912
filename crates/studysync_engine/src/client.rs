//! The public sync surface.

use crate::bus::{EventBus, SubscriptionId, SyncNotification};
use crate::channel::{ChannelEvent, SyncChannel};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connection::{
    ConnectionManager, ConnectionSignal, ConnectionState, ConnectionStats, ScheduledRetry,
};
use crate::device::DeviceId;
use crate::error::{SyncError, SyncResult};
use crate::queue::OfflineQueue;
use crate::resolver::{Conflict, ConflictChoice, ConflictResolver, ImageAnnotations};
use serde_json::{Map, Value};
use std::sync::Arc;
use studysync_protocol::{
    Annotation, AnnotationPayload, BookmarkPayload, EventPayload, PreferencesPayload,
    ProgressPayload, SyncEvent,
};
use studysync_storage::KeyValueStore;
use tracing::warn;

/// One device's sync context.
///
/// Construct one at startup and hand it (or a [`crate::SyncHandle`]) to the
/// parts of the application that need it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use studysync_engine::{MockChannel, SyncClient, SyncConfig};
/// use studysync_storage::InMemoryStore;
///
/// let config = SyncConfig::from_endpoint("wss://sync.example.com/ws").unwrap();
/// let mut client = SyncClient::new(config, MockChannel::new(), Arc::new(InMemoryStore::new()));
///
/// client.sync_bookmark("case-12", true);
/// assert_eq!(client.pending_events(), 1);
/// ```
pub struct SyncClient<C: SyncChannel> {
    device_id: DeviceId,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    resolver: ConflictResolver,
    connection: ConnectionManager<C>,
}

impl<C: SyncChannel> SyncClient<C> {
    /// Creates a client using the system clock.
    pub fn new(config: SyncConfig, channel: C, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(config, channel, store, Arc::new(SystemClock))
    }

    /// Creates a client with an explicit clock.
    ///
    /// The device id and the offline queue are restored from `store`.
    pub fn with_clock(
        config: SyncConfig,
        channel: C,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let device_id = DeviceId::load_or_create(store.as_ref(), &config.device_key);
        let queue = OfflineQueue::load(Arc::clone(&store), config.queue_key.clone());
        let bus = Arc::new(EventBus::new());
        let resolver = ConflictResolver::new(device_id.as_str(), Arc::clone(&clock), Arc::clone(&bus));
        let connection = ConnectionManager::new(config, device_id.as_str(), channel, queue);
        Self {
            device_id,
            clock,
            bus,
            resolver,
            connection,
        }
    }

    /// Returns this installation's device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the notification bus, for sharing with other threads.
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Subscribes to notifications called `name`.
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncNotification) + Send + Sync + 'static,
    {
        self.bus.on(name, handler)
    }

    /// Removes a subscription.
    pub fn off(&self, name: &str, id: SubscriptionId) -> bool {
        self.bus.off(name, id)
    }

    /// Stamps and sends an event. Returns the event as sent or queued.
    ///
    /// Custom payloads that reuse a built-in or reserved type name are
    /// refused with [`SyncError::MalformedMessage`] and never queued.
    pub fn send(&mut self, payload: EventPayload) -> SyncResult<SyncEvent> {
        if let Err(e) = payload.validate() {
            warn!(error = %e, event_type = payload.event_type(), "refusing to send event");
            return Err(SyncError::MalformedMessage(e));
        }
        Ok(self.stamp_and_send(payload))
    }

    /// Sends study progress for a case.
    pub fn sync_progress(&mut self, case_id: impl Into<String>, data: Value) -> SyncEvent {
        self.stamp_and_send(EventPayload::Progress(ProgressPayload {
            case_id: case_id.into(),
            data,
        }))
    }

    /// Sends the bookmark flag of a case.
    pub fn sync_bookmark(&mut self, case_id: impl Into<String>, bookmarked: bool) -> SyncEvent {
        self.stamp_and_send(EventPayload::Bookmark(BookmarkPayload {
            case_id: case_id.into(),
            bookmarked,
        }))
    }

    /// Sends the annotations of an image.
    pub fn sync_annotation(
        &mut self,
        image_id: impl Into<String>,
        annotations: Vec<Annotation>,
    ) -> SyncEvent {
        self.stamp_and_send(EventPayload::Annotations(AnnotationPayload {
            image_id: image_id.into(),
            annotations,
        }))
    }

    /// Sends the preference document.
    pub fn sync_preferences(&mut self, preferences: Map<String, Value>) -> SyncEvent {
        self.stamp_and_send(EventPayload::Preferences(PreferencesPayload { preferences }))
    }

    /// Resolves an open conflict.
    ///
    /// Choosing [`ConflictChoice::Local`] re-sends the local version so the
    /// other devices converge.
    pub fn resolve_conflict(&mut self, conflict_id: &str, choice: ConflictChoice) -> SyncResult<()> {
        let resolution = self.resolver.resolve(conflict_id, choice)?;
        if let Some(payload) = resolution.outbound {
            self.stamp_and_send(payload);
        }
        Ok(())
    }

    /// Returns a snapshot of the unresolved conflicts.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.resolver.conflicts()
    }

    /// Returns the locally tracked annotations of an image.
    pub fn annotations_for(&self, image_id: &str) -> Option<&ImageAnnotations> {
        self.resolver.annotations_for(image_id)
    }

    /// Opens the channel.
    pub fn connect(&mut self, token: impl Into<String>) {
        let signals = self.connection.connect(token);
        self.dispatch(signals);
    }

    /// Closes the channel and cancels any pending reconnect.
    pub fn disconnect(&mut self) {
        let signals = self.connection.disconnect();
        self.dispatch(signals);
    }

    /// Feeds one channel callback through the state machine.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        let signals = self.connection.handle_channel_event(event);
        self.dispatch(signals);
    }

    /// Fires the pending reconnect; call when its delay has elapsed.
    pub fn fire_scheduled_retry(&mut self) {
        let signals = self.connection.fire_scheduled_retry();
        self.dispatch(signals);
    }

    /// Returns the pending reconnect, if any.
    pub fn scheduled_retry(&self) -> Option<ScheduledRetry> {
        self.connection.scheduled_retry()
    }

    /// Gets the connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Gets the connection stats.
    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    /// Returns the number of events waiting in the offline queue.
    pub fn pending_events(&self) -> usize {
        self.connection.queue().len()
    }

    /// Drops every queued outbound event.
    pub fn clear_pending(&mut self) -> SyncResult<()> {
        self.connection.queue_mut().clear()
    }

    /// Returns the channel.
    pub fn channel(&self) -> &C {
        self.connection.channel()
    }

    fn stamp_and_send(&mut self, payload: EventPayload) -> SyncEvent {
        let event = SyncEvent::new(payload, self.device_id.as_str(), self.clock.now());
        self.resolver.record_local(&event);
        let signals = self.connection.send(event.clone());
        self.dispatch(signals);
        event
    }

    fn dispatch(&mut self, signals: Vec<ConnectionSignal>) {
        for signal in signals {
            match signal {
                ConnectionSignal::Deliver(event) => {
                    self.resolver.apply(event);
                }
                ConnectionSignal::Notify(notification) => {
                    self.bus.emit(&notification);
                }
            }
        }
    }
}
