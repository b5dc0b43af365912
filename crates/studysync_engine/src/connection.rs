//! Connection lifecycle state machine.
//!
//! The manager is sans-IO: it owns the [`SyncChannel`] and the offline
//! queue, consumes [`ChannelEvent`]s one at a time, and reports what the
//! caller must do next as an ordered list of [`ConnectionSignal`]s. Timers
//! are not armed here; the pending retry is exposed through
//! [`ConnectionManager::scheduled_retry`] and fired with
//! [`ConnectionManager::fire_scheduled_retry`].

use crate::bus::SyncNotification;
use crate::channel::{ChannelEvent, ChannelTarget, SyncChannel};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::queue::OfflineQueue;
use std::time::Duration;
use studysync_protocol::{decode_frame, InboundFrame, SyncEvent};
use tracing::{debug, error, info, warn};

/// The current state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel and no retry pending.
    Disconnected,
    /// The channel is opening.
    Connecting,
    /// The channel is open and the offline queue has been flushed.
    Connected,
    /// Waiting for a scheduled retry.
    Reconnecting,
}

impl ConnectionState {
    /// Returns true if a channel is open or opening.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// A reconnect the driver must arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    /// Retry number, starting at 1.
    pub attempt: u32,
    /// Delay before firing.
    pub delay: Duration,
    /// Changes whenever a retry is scheduled or cancelled.
    pub generation: u64,
}

/// Work produced by a transition, in the order it must be carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    /// Pass an inbound event to the conflict resolver.
    Deliver(SyncEvent),
    /// Emit a lifecycle notification.
    Notify(SyncNotification),
}

/// Statistics about the connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Frames transmitted, live or flushed.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Events handed to the offline queue.
    pub events_queued: u64,
    /// Queued events transmitted on reconnect.
    pub events_flushed: u64,
    /// Retries scheduled.
    pub reconnects_scheduled: u64,
    /// Inbound frames or catch-up entries dropped as malformed.
    pub malformed_frames: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Owns the single logical channel.
///
/// # Invariants
///
/// - At most one retry is pending at a time
/// - No retry is scheduled after a manual disconnect or an auth rejection
/// - Outbound events are never dropped: they are sent or queued
pub struct ConnectionManager<C: SyncChannel> {
    config: SyncConfig,
    device_id: String,
    channel: C,
    queue: OfflineQueue,
    state: ConnectionState,
    token: Option<String>,
    attempt: u32,
    scheduled: Option<ScheduledRetry>,
    generation: u64,
    auth_rejected: bool,
    stats: ConnectionStats,
}

impl<C: SyncChannel> ConnectionManager<C> {
    /// Creates a disconnected manager.
    pub fn new(config: SyncConfig, device_id: impl Into<String>, channel: C, queue: OfflineQueue) -> Self {
        Self {
            config,
            device_id: device_id.into(),
            channel,
            queue,
            state: ConnectionState::Disconnected,
            token: None,
            attempt: 0,
            scheduled: None,
            generation: 0,
            auth_rejected: false,
            stats: ConnectionStats::default(),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Gets the current stats.
    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Returns the pending retry, if any.
    pub fn scheduled_retry(&self) -> Option<ScheduledRetry> {
        self.scheduled
    }

    /// Returns true once the server rejected the current token.
    pub fn is_auth_rejected(&self) -> bool {
        self.auth_rejected
    }

    /// Returns the offline queue.
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Returns the offline queue mutably.
    pub fn queue_mut(&mut self) -> &mut OfflineQueue {
        &mut self.queue
    }

    /// Returns the channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Opens the channel with `token` unless it is already open or opening.
    ///
    /// Clears an auth rejection and restarts the retry budget.
    pub fn connect(&mut self, token: impl Into<String>) -> Vec<ConnectionSignal> {
        if self.state.is_active() {
            debug!(state = ?self.state, "connect ignored, channel already active");
            return Vec::new();
        }
        self.token = Some(token.into());
        self.auth_rejected = false;
        self.attempt = 0;
        self.cancel_retry();
        self.open()
    }

    /// Closes the channel and cancels any pending retry.
    pub fn disconnect(&mut self) -> Vec<ConnectionSignal> {
        self.cancel_retry();
        let previous = self.state;
        self.state = ConnectionState::Disconnected;
        if previous.is_active() {
            self.channel.close();
        }
        if previous == ConnectionState::Disconnected {
            return Vec::new();
        }
        info!(device_id = %self.device_id, "disconnected by request");
        vec![ConnectionSignal::Notify(SyncNotification::Disconnected {
            code: Some(crate::channel::NORMAL_CLOSE),
            reason: "client disconnect".into(),
        })]
    }

    /// Transmits an event now, or queues it if the channel is not open.
    pub fn send(&mut self, event: SyncEvent) -> Vec<ConnectionSignal> {
        if self.state != ConnectionState::Connected {
            self.enqueue(event);
            return Vec::new();
        }
        match self.transmit(&event) {
            Ok(()) => Vec::new(),
            Err(message) => {
                self.enqueue(event);
                self.handle_drop(None, message)
            }
        }
    }

    /// Fires the pending retry.
    pub fn fire_scheduled_retry(&mut self) -> Vec<ConnectionSignal> {
        if self.scheduled.take().is_none() || self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        debug!(attempt = self.attempt, "firing scheduled reconnect");
        self.open()
    }

    /// Applies one channel callback.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<ConnectionSignal> {
        match event {
            ChannelEvent::Opened => self.on_open(),
            ChannelEvent::Message(text) => self.on_message(&text),
            ChannelEvent::Closed { code, reason } => self.on_close(code, reason),
            ChannelEvent::Error(message) => {
                if !self.state.is_active() {
                    debug!(%message, "ignoring error on inactive channel");
                    return Vec::new();
                }
                self.handle_drop(None, message)
            }
        }
    }

    fn open(&mut self) -> Vec<ConnectionSignal> {
        let Some(token) = self.token.as_deref() else {
            warn!("cannot open channel without a token");
            self.state = ConnectionState::Disconnected;
            return Vec::new();
        };
        let target = ChannelTarget::new(&self.config.endpoint, token, &self.device_id);
        self.state = ConnectionState::Connecting;
        debug!(device_id = %self.device_id, endpoint = %self.config.endpoint, "opening channel");
        match self.channel.open(&target) {
            Ok(()) => Vec::new(),
            Err(SyncError::AuthRejected) => self.reject_auth(None, "rejected on open".into()),
            Err(e) if e.is_retryable() => self.handle_drop(None, e.to_string()),
            Err(e) => {
                error!(error = %e, "channel cannot be opened, not retrying");
                self.state = ConnectionState::Disconnected;
                self.cancel_retry();
                self.stats.last_error = Some(e.to_string());
                vec![ConnectionSignal::Notify(SyncNotification::Disconnected {
                    code: None,
                    reason: e.to_string(),
                })]
            }
        }
    }

    fn on_open(&mut self) -> Vec<ConnectionSignal> {
        if self.state != ConnectionState::Connecting {
            debug!(state = ?self.state, "ignoring open on inactive channel");
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;

        let channel = &mut self.channel;
        let stats = &mut self.stats;
        let outcome = self.queue.flush(|event| match event.to_json() {
            Ok(frame) => match channel.send(&frame) {
                Ok(()) => {
                    stats.frames_sent += 1;
                    stats.events_flushed += 1;
                    true
                }
                Err(_) => false,
            },
            Err(e) => {
                error!(error = %e, "dropping unencodable queued event");
                true
            }
        });

        if !outcome.is_complete() {
            warn!(sent = outcome.sent, remaining = outcome.remaining, "channel dropped during queue flush");
            return self.handle_drop(None, "send failed during queue flush".into());
        }
        info!(device_id = %self.device_id, flushed = outcome.sent, "connected");
        vec![ConnectionSignal::Notify(SyncNotification::Connected)]
    }

    fn on_message(&mut self, text: &str) -> Vec<ConnectionSignal> {
        if self.state != ConnectionState::Connected {
            debug!(state = ?self.state, "ignoring frame on inactive channel");
            return Vec::new();
        }
        self.stats.frames_received += 1;
        match decode_frame(text) {
            Ok(InboundFrame::Event(event)) => vec![ConnectionSignal::Deliver(event)],
            Ok(InboundFrame::Catchup(batch)) => {
                let total = batch.events.len();
                let mut signals = Vec::with_capacity(total + 1);
                for decoded in batch.decode() {
                    match decoded {
                        Ok(event) => signals.push(ConnectionSignal::Deliver(event)),
                        Err(e) => {
                            self.stats.malformed_frames += 1;
                            warn!(error = %e, "dropping malformed catch-up entry");
                        }
                    }
                }
                debug!(events = total, "replaying catch-up batch");
                signals.push(ConnectionSignal::Notify(SyncNotification::Catchup { events: total }));
                signals
            }
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!(error = %e, "dropping malformed frame");
                Vec::new()
            }
        }
    }

    fn on_close(&mut self, code: u16, reason: String) -> Vec<ConnectionSignal> {
        if !self.state.is_active() {
            debug!(code, "ignoring close on inactive channel");
            return Vec::new();
        }
        if code == self.config.auth_rejected_close_code {
            return self.reject_auth(Some(code), reason);
        }
        self.handle_drop(Some(code), reason)
    }

    /// The server refused the token. Terminal until the next `connect`.
    fn reject_auth(&mut self, code: Option<u16>, reason: String) -> Vec<ConnectionSignal> {
        warn!(?code, %reason, "authentication rejected, not reconnecting");
        self.auth_rejected = true;
        self.state = ConnectionState::Disconnected;
        self.cancel_retry();
        self.stats.last_error = Some(format!("auth rejected: {reason}"));
        vec![
            ConnectionSignal::Notify(SyncNotification::AuthRejected),
            ConnectionSignal::Notify(SyncNotification::Disconnected { code, reason }),
        ]
    }

    /// Unexpected close or error: schedule a retry while the budget lasts.
    ///
    /// `code` is set only when the peer closed the channel; otherwise the
    /// local end is torn down before any retry reopens it.
    fn handle_drop(&mut self, code: Option<u16>, reason: String) -> Vec<ConnectionSignal> {
        if code.is_none() && self.state.is_active() {
            self.channel.close();
        }
        self.stats.last_error = Some(reason.clone());
        let mut signals = vec![ConnectionSignal::Notify(SyncNotification::Disconnected {
            code,
            reason: reason.clone(),
        })];

        if self.attempt >= self.config.retry.max_attempts {
            warn!(attempts = self.attempt, %reason, "reconnect attempts exhausted");
            self.state = ConnectionState::Disconnected;
            self.cancel_retry();
            return signals;
        }

        let delay = self.config.retry.delay_for_attempt(self.attempt);
        self.attempt += 1;
        self.generation += 1;
        self.scheduled = Some(ScheduledRetry {
            attempt: self.attempt,
            delay,
            generation: self.generation,
        });
        self.state = ConnectionState::Reconnecting;
        self.stats.reconnects_scheduled += 1;
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "connection lost, reconnect scheduled"
        );
        signals.push(ConnectionSignal::Notify(SyncNotification::Reconnecting {
            attempt: self.attempt,
            delay,
        }));
        signals
    }

    fn transmit(&mut self, event: &SyncEvent) -> Result<(), String> {
        let frame = event.to_json().map_err(|e| e.to_string())?;
        self.channel.send(&frame).map_err(|e| e.to_string())?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    fn enqueue(&mut self, event: SyncEvent) {
        self.stats.events_queued += 1;
        if let Err(e) = self.queue.enqueue(event) {
            warn!(error = %e, pending = self.queue.len(), "offline queue kept in memory only");
        }
    }

    fn cancel_retry(&mut self) {
        if self.scheduled.take().is_some() {
            self.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MockChannel, ABNORMAL_CLOSE};
    use crate::config::RetryConfig;
    use serde_json::json;
    use std::sync::Arc;
    use studysync_protocol::{EventPayload, ProgressPayload, Timestamp};
    use studysync_storage::InMemoryStore;

    fn manager() -> (ConnectionManager<MockChannel>, MockChannel) {
        let channel = MockChannel::new();
        let queue = OfflineQueue::load(Arc::new(InMemoryStore::new()), "q");
        let config = SyncConfig::from_endpoint("wss://sync.example.com/ws").unwrap();
        (ConnectionManager::new(config, "A", channel.clone(), queue), channel)
    }

    fn event(case: &str) -> SyncEvent {
        SyncEvent::new(
            EventPayload::Progress(ProgressPayload {
                case_id: case.into(),
                data: json!(1),
            }),
            "A",
            Timestamp::parse("2024-05-01T08:00:00.000Z").unwrap(),
        )
    }

    fn drop_channel() -> ChannelEvent {
        ChannelEvent::Closed {
            code: ABNORMAL_CLOSE,
            reason: "gone".into(),
        }
    }

    fn names(signals: &[ConnectionSignal]) -> Vec<String> {
        signals
            .iter()
            .map(|s| match s {
                ConnectionSignal::Deliver(e) => format!("deliver:{}", e.event_type()),
                ConnectionSignal::Notify(n) => n.name().to_string(),
            })
            .collect()
    }

    #[test]
    fn connect_opens_with_token_and_device() {
        let (mut conn, channel) = manager();
        assert!(conn.connect("tok1").is_empty());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let target = &channel.open_targets()[0];
        assert_eq!(target.param("token").as_deref(), Some("tok1"));
        assert_eq!(target.param("deviceId").as_deref(), Some("A"));

        // Already opening: no second open.
        conn.connect("tok1");
        assert_eq!(channel.open_count(), 1);
    }

    #[test]
    fn open_flushes_queue_then_reports_connected() {
        let (mut conn, channel) = manager();
        conn.send(event("c1"));
        conn.send(event("c2"));
        assert_eq!(conn.queue().len(), 2);

        conn.connect("tok1");
        let signals = conn.handle_channel_event(ChannelEvent::Opened);

        assert_eq!(names(&signals), vec!["connected"]);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.queue().is_empty());
        assert_eq!(channel.sent_events(), vec![event("c1"), event("c2")]);
        assert_eq!(conn.stats().events_flushed, 2);
    }

    #[test]
    fn drop_mid_flush_keeps_remaining_entries() {
        let (mut conn, channel) = manager();
        for case in ["c1", "c2", "c3"] {
            conn.send(event(case));
        }
        channel.fail_sends_after(1);

        conn.connect("tok1");
        let signals = conn.handle_channel_event(ChannelEvent::Opened);

        assert_eq!(names(&signals), vec!["disconnected", "reconnecting"]);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert_eq!(channel.sent_events(), vec![event("c1")]);
        let queued: Vec<_> = conn.queue().iter().cloned().collect();
        assert_eq!(queued, vec![event("c2"), event("c3")]);
        assert_eq!(channel.close_count(), 1);
    }

    #[test]
    fn live_send_failure_queues_and_reconnects() {
        let (mut conn, channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(ChannelEvent::Opened);

        channel.fail_sends_after(0);
        let signals = conn.send(event("c1"));

        assert_eq!(names(&signals), vec!["disconnected", "reconnecting"]);
        assert_eq!(conn.queue().len(), 1);
        assert_eq!(channel.close_count(), 1);

        channel.heal();
        conn.fire_scheduled_retry();
        assert_eq!(channel.open_count(), 2);
        assert_eq!(channel.close_count(), 1);
    }

    #[test]
    fn channel_error_closes_transport_but_peer_close_does_not() {
        let (mut conn, channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(ChannelEvent::Opened);
        conn.handle_channel_event(ChannelEvent::Error("reset".into()));
        assert_eq!(channel.close_count(), 1);

        conn.fire_scheduled_retry();
        conn.handle_channel_event(ChannelEvent::Opened);
        conn.handle_channel_event(drop_channel());
        assert_eq!(channel.close_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn backoff_schedule_is_capped() {
        let (mut conn, _channel) = manager();
        conn.connect("tok1");

        let mut delays = Vec::new();
        for _ in 0..11 {
            conn.handle_channel_event(drop_channel());
            match conn.scheduled_retry() {
                Some(retry) => {
                    delays.push(retry.delay.as_secs());
                    conn.fire_scheduled_retry();
                    assert_eq!(conn.state(), ConnectionState::Connecting);
                }
                None => break,
            }
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.scheduled_retry().is_none());
        assert_eq!(conn.stats().reconnects_scheduled, 10);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let (mut conn, _channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(drop_channel());
        conn.fire_scheduled_retry();
        conn.handle_channel_event(drop_channel());
        assert_eq!(conn.scheduled_retry().unwrap().delay, Duration::from_secs(2));

        conn.fire_scheduled_retry();
        conn.handle_channel_event(ChannelEvent::Opened);
        conn.handle_channel_event(drop_channel());
        assert_eq!(conn.scheduled_retry().unwrap().delay, Duration::from_secs(1));
    }

    #[test]
    fn auth_rejection_is_terminal() {
        let (mut conn, channel) = manager();
        conn.connect("stale");
        conn.handle_channel_event(ChannelEvent::Opened);

        let signals = conn.handle_channel_event(ChannelEvent::Closed {
            code: 4001,
            reason: "token expired".into(),
        });

        assert_eq!(names(&signals), vec!["auth-rejected", "disconnected"]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.is_auth_rejected());
        assert!(conn.scheduled_retry().is_none());
        assert!(conn.fire_scheduled_retry().is_empty());

        conn.connect("fresh");
        assert!(!conn.is_auth_rejected());
        assert_eq!(channel.open_count(), 2);
        assert_eq!(channel.open_targets()[1].param("token").as_deref(), Some("fresh"));
    }

    #[test]
    fn auth_rejection_on_open_is_terminal() {
        let (mut conn, channel) = manager();
        channel.set_reject_auth(true);

        let signals = conn.connect("bad");
        assert_eq!(names(&signals), vec!["auth-rejected", "disconnected"]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.is_auth_rejected());
        assert!(conn.scheduled_retry().is_none());
        assert_eq!(conn.stats().reconnects_scheduled, 0);

        channel.set_reject_auth(false);
        conn.connect("good");
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.is_auth_rejected());
    }

    #[test]
    fn manual_disconnect_cancels_retry() {
        let (mut conn, channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(drop_channel());
        let before = conn.scheduled_retry().unwrap();

        let signals = conn.disconnect();
        assert_eq!(names(&signals), vec!["disconnected"]);
        assert!(conn.scheduled_retry().is_none());
        assert!(conn.fire_scheduled_retry().is_empty());
        assert_eq!(channel.open_count(), 1);
        assert!(before.generation > 0);

        // The close callback that follows a manual close is ignored.
        assert!(conn.handle_channel_event(drop_channel()).is_empty());
    }

    #[test]
    fn disconnect_closes_open_channel() {
        let (mut conn, channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(ChannelEvent::Opened);
        conn.disconnect();

        assert_eq!(channel.close_count(), 1);
        assert!(conn.disconnect().is_empty());
    }

    #[test]
    fn open_failure_schedules_retry() {
        let (mut conn, channel) = manager();
        channel.set_fail_open(true);
        let signals = conn.connect("tok1");

        assert_eq!(names(&signals), vec!["disconnected", "reconnecting"]);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn no_retry_policy_stays_disconnected() {
        let channel = MockChannel::new();
        let queue = OfflineQueue::load(Arc::new(InMemoryStore::new()), "q");
        let config = SyncConfig::from_endpoint("wss://sync.example.com/ws")
            .unwrap()
            .with_retry(RetryConfig::no_retry());
        let mut conn = ConnectionManager::new(config, "A", channel, queue);

        conn.connect("tok1");
        conn.handle_channel_event(drop_channel());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.scheduled_retry().is_none());
    }

    #[test]
    fn inbound_frames_are_delivered_and_garbage_dropped() {
        let (mut conn, _channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(ChannelEvent::Opened);

        let live = event("c9").to_json().unwrap();
        let signals = conn.handle_channel_event(ChannelEvent::Message(live));
        assert_eq!(names(&signals), vec!["deliver:sync:progress"]);

        let signals = conn.handle_channel_event(ChannelEvent::Message("{oops".into()));
        assert!(signals.is_empty());
        assert_eq!(conn.stats().malformed_frames, 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn catchup_replays_entries_in_order() {
        let (mut conn, _channel) = manager();
        conn.connect("tok1");
        conn.handle_channel_event(ChannelEvent::Opened);

        let frame = json!({
            "type": "catchup",
            "payload": { "events": [
                serde_json::to_value(event("c1")).unwrap(),
                { "type": "sync:progress", "payload": {}, "deviceId": "B", "timestamp": "2024-05-01T08:00:00.000Z" },
                serde_json::to_value(event("c2")).unwrap(),
            ]}
        })
        .to_string();

        let signals = conn.handle_channel_event(ChannelEvent::Message(frame));
        assert_eq!(
            signals,
            vec![
                ConnectionSignal::Deliver(event("c1")),
                ConnectionSignal::Deliver(event("c2")),
                ConnectionSignal::Notify(SyncNotification::Catchup { events: 3 }),
            ]
        );
        assert_eq!(conn.stats().malformed_frames, 1);
    }
}
