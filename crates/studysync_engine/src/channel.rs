//! Channel abstraction for the bidirectional sync connection.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::Arc;
use studysync_protocol::SyncEvent;
use url::Url;

/// Close code of an orderly, intentional close.
pub const NORMAL_CLOSE: u16 = 1000;

/// Close code of an abnormal drop with no close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Where and as whom to open the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    url: Url,
}

impl ChannelTarget {
    /// Appends the `token` and `deviceId` parameters to `endpoint`.
    pub fn new(endpoint: &Url, token: &str, device_id: &str) -> Self {
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("deviceId", device_id);
        Self { url }
    }

    /// Returns the full connection URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the value of a query parameter.
    pub fn param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// Lifecycle callbacks of the channel, delivered one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel finished opening.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The channel closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The channel failed.
    Error(String),
}

/// The transport underneath the connection manager.
///
/// Implementations start I/O and return immediately; completion and inbound
/// traffic are reported back as [`ChannelEvent`]s. Establishing the actual
/// transport (TLS, HTTP upgrade) is the implementor's concern.
pub trait SyncChannel: Send {
    /// Starts opening the channel.
    ///
    /// Return [`SyncError::AuthRejected`] when the server refuses the token
    /// up front; no retry follows. Retryable errors schedule a reconnect.
    fn open(&mut self, target: &ChannelTarget) -> SyncResult<()>;

    /// Transmits one text frame.
    fn send(&mut self, frame: &str) -> SyncResult<()>;

    /// Closes the channel with [`NORMAL_CLOSE`].
    fn close(&mut self);
}

#[derive(Debug, Default)]
struct MockState {
    targets: Vec<ChannelTarget>,
    sent: Vec<String>,
    closes: usize,
    fail_open: bool,
    reject_auth: bool,
    sends_before_failure: Option<usize>,
}

/// A recording channel for tests.
///
/// Clones share state, so a test can keep one handle while the engine owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// Creates a new mock channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `open` fail synchronously.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Makes `open` fail with [`SyncError::AuthRejected`], as a transport
    /// would on an HTTP 401 during the upgrade.
    pub fn set_reject_auth(&self, reject: bool) {
        self.state.lock().reject_auth = reject;
    }

    /// Lets the next `count` sends succeed and fails every send after that.
    pub fn fail_sends_after(&self, count: usize) {
        self.state.lock().sends_before_failure = Some(count);
    }

    /// Lets every send succeed again.
    pub fn heal(&self) {
        self.state.lock().sends_before_failure = None;
    }

    /// Returns every target `open` was called with.
    pub fn open_targets(&self) -> Vec<ChannelTarget> {
        self.state.lock().targets.clone()
    }

    /// Returns how many times `open` was called.
    pub fn open_count(&self) -> usize {
        self.state.lock().targets.len()
    }

    /// Returns how many times `close` was called.
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Returns every frame sent so far.
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Decodes every frame sent so far.
    pub fn sent_events(&self) -> Vec<SyncEvent> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|frame| SyncEvent::from_json(frame).ok())
            .collect()
    }

    /// Returns and forgets the frames sent so far.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().sent)
    }
}

impl SyncChannel for MockChannel {
    fn open(&mut self, target: &ChannelTarget) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.targets.push(target.clone());
        if state.reject_auth {
            return Err(SyncError::AuthRejected);
        }
        if state.fail_open {
            return Err(SyncError::connection("mock open failure"));
        }
        Ok(())
    }

    fn send(&mut self, frame: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        match state.sends_before_failure {
            Some(0) => return Err(SyncError::connection("mock send failure")),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        state.sent.push(frame.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().closes += 1;
    }
}
