//! Single-task dispatch loop driving a [`SyncClient`].
//!
//! The loop owns the client. Channel callbacks arrive on one queue,
//! application commands on another, and the pending reconnect is armed as a
//! timer. Exactly one of them is handled at a time, so the client's state is
//! never touched concurrently.

use crate::bus::{EventBus, SubscriptionId, SyncNotification};
use crate::channel::{ChannelEvent, SyncChannel};
use crate::client::SyncClient;
use crate::connection::ConnectionState;
use crate::device::DeviceId;
use crate::error::{SyncError, SyncResult};
use crate::resolver::{Conflict, ConflictChoice};
use serde_json::{Map, Value};
use std::sync::Arc;
use studysync_protocol::{
    Annotation, AnnotationPayload, BookmarkPayload, EventPayload, PreferencesPayload,
    ProgressPayload,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

enum Command {
    Connect(String),
    Disconnect,
    Send(EventPayload),
    Resolve {
        conflict_id: String,
        choice: ConflictChoice,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Conflicts(oneshot::Sender<Vec<Conflict>>),
    State(oneshot::Sender<ConnectionState>),
    Shutdown,
}

/// Cloneable handle to a running [`SyncRuntime`].
///
/// Every method returns immediately; sends never wait for the network.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<EventBus>,
    device_id: DeviceId,
}

impl SyncHandle {
    /// Returns the device id of the client behind this handle.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Opens the channel.
    pub fn connect(&self, token: impl Into<String>) -> SyncResult<()> {
        self.command(Command::Connect(token.into()))
    }

    /// Closes the channel and cancels any pending reconnect.
    pub fn disconnect(&self) -> SyncResult<()> {
        self.command(Command::Disconnect)
    }

    /// Sends an event.
    pub fn send(&self, payload: EventPayload) -> SyncResult<()> {
        payload.validate()?;
        self.command(Command::Send(payload))
    }

    /// Sends study progress for a case.
    pub fn sync_progress(&self, case_id: impl Into<String>, data: Value) -> SyncResult<()> {
        self.send(EventPayload::Progress(ProgressPayload {
            case_id: case_id.into(),
            data,
        }))
    }

    /// Sends the bookmark flag of a case.
    pub fn sync_bookmark(&self, case_id: impl Into<String>, bookmarked: bool) -> SyncResult<()> {
        self.send(EventPayload::Bookmark(BookmarkPayload {
            case_id: case_id.into(),
            bookmarked,
        }))
    }

    /// Sends the annotations of an image.
    pub fn sync_annotation(
        &self,
        image_id: impl Into<String>,
        annotations: Vec<Annotation>,
    ) -> SyncResult<()> {
        self.send(EventPayload::Annotations(AnnotationPayload {
            image_id: image_id.into(),
            annotations,
        }))
    }

    /// Sends the preference document.
    pub fn sync_preferences(&self, preferences: Map<String, Value>) -> SyncResult<()> {
        self.send(EventPayload::Preferences(PreferencesPayload { preferences }))
    }

    /// Resolves an open conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: impl Into<String>,
        choice: ConflictChoice,
    ) -> SyncResult<()> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Resolve {
            conflict_id: conflict_id.into(),
            choice,
            reply,
        })?;
        response.await.map_err(|_| SyncError::RuntimeStopped)?
    }

    /// Returns a snapshot of the unresolved conflicts.
    pub async fn conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Conflicts(reply))?;
        response.await.map_err(|_| SyncError::RuntimeStopped)
    }

    /// Returns the connection state.
    pub async fn state(&self) -> SyncResult<ConnectionState> {
        let (reply, response) = oneshot::channel();
        self.command(Command::State(reply))?;
        response.await.map_err(|_| SyncError::RuntimeStopped)
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

    /// Stops the dispatch loop.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.command(Command::Shutdown)
    }

    fn command(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::RuntimeStopped)
    }
}

/// The dispatch loop.
pub struct SyncRuntime<C: SyncChannel> {
    client: SyncClient<C>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C: SyncChannel> SyncRuntime<C> {
    /// Wraps a client. `channel_events` carries the transport's callbacks.
    pub fn new(
        client: SyncClient<C>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SyncHandle {
            commands: tx,
            bus: client.bus(),
            device_id: client.device_id().clone(),
        };
        let runtime = Self {
            client,
            channel_events,
            commands: rx,
        };
        (runtime, handle)
    }

    /// Runs until shut down or every handle is dropped. Returns the client.
    pub async fn run(mut self) -> SyncClient<C> {
        let mut armed: Option<(u64, Instant)> = None;
        let mut events_open = true;

        loop {
            armed = match self.client.scheduled_retry() {
                Some(retry) => match armed {
                    Some((generation, deadline)) if generation == retry.generation => {
                        Some((generation, deadline))
                    }
                    _ => Some((retry.generation, Instant::now() + retry.delay)),
                },
                None => None,
            };
            let deadline = armed.map(|(_, deadline)| deadline);

            tokio::select! {
                biased;

                event = self.channel_events.recv(), if events_open => match event {
                    Some(event) => self.client.handle_channel_event(event),
                    None => {
                        debug!("channel event source closed");
                        events_open = false;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    armed = None;
                    self.client.fire_scheduled_retry();
                }
            }
        }

        debug!(device_id = %self.client.device_id(), "sync runtime stopped");
        self.client
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect(token) => self.client.connect(token),
            Command::Disconnect => self.client.disconnect(),
            Command::Send(payload) => {
                // Checked by the handle; a refusal is already logged.
                let _ = self.client.send(payload);
            }
            Command::Resolve {
                conflict_id,
                choice,
                reply,
            } => {
                let _ = reply.send(self.client.resolve_conflict(&conflict_id, choice));
            }
            Command::Conflicts(reply) => {
                let _ = reply.send(self.client.conflicts());
            }
            Command::State(reply) => {
                let _ = reply.send(self.client.state());
            }
            Command::Shutdown => {}
        }
    }
}
