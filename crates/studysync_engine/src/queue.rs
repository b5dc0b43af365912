//! Durable FIFO of outbound events awaiting delivery.

use crate::error::{SyncError, SyncResult};
use std::collections::VecDeque;
use std::sync::Arc;
use studysync_protocol::{SyncEvent, WireMessage};
use studysync_storage::KeyValueStore;
use tracing::{debug, warn};

/// Result of draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Entries transmitted and removed.
    pub sent: usize,
    /// Entries still queued.
    pub remaining: usize,
}

impl FlushOutcome {
    /// Returns true if the queue was drained completely.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Ordered store of outbound events pending delivery.
///
/// The whole queue is serialized as a JSON array under one storage key
/// after every mutation.
///
/// # Invariants
///
/// - Entries leave in exactly the order they were enqueued
/// - An entry is removed only after its transmission succeeded
/// - A persistence failure never loses or reorders in-memory entries
pub struct OfflineQueue {
    entries: VecDeque<SyncEvent>,
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl OfflineQueue {
    /// Restores the queue persisted under `key`.
    ///
    /// Missing, unreadable or corrupted state yields an empty queue.
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let entries: VecDeque<SyncEvent> = match store.get(&key) {
            Ok(Some(text)) => match serde_json::from_str::<Vec<WireMessage>>(&text) {
                Ok(entries) => entries
                    .into_iter()
                    .filter_map(|wire| match SyncEvent::try_from(wire) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(error = %e, key = %key, "dropping undecodable queued event");
                            None
                        }
                    })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, key = %key, "discarding corrupted offline queue");
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(error = %e, key = %key, "offline queue unreadable, starting empty");
                VecDeque::new()
            }
        };
        if !entries.is_empty() {
            debug!(pending = entries.len(), "restored offline queue");
        }
        Self {
            entries,
            store,
            key,
        }
    }

    /// Appends an event and persists the queue.
    ///
    /// The event is queued even when persisting fails; the error only
    /// reports that durability was lost.
    pub fn enqueue(&mut self, event: SyncEvent) -> SyncResult<()> {
        self.entries.push_back(event);
        self.persist()
    }

    /// Drains entries in order, calling `transmit` once per entry.
    ///
    /// Stops at the first entry `transmit` reports as not sent; that entry
    /// and everything behind it stay queued untouched.
    pub fn flush<F>(&mut self, mut transmit: F) -> FlushOutcome
    where
        F: FnMut(&SyncEvent) -> bool,
    {
        let mut sent = 0;
        while let Some(front) = self.entries.front() {
            if !transmit(front) {
                break;
            }
            self.entries.pop_front();
            sent += 1;
            if let Err(e) = self.persist() {
                warn!(error = %e, "offline queue not persisted after send");
            }
        }
        FlushOutcome {
            sent,
            remaining: self.entries.len(),
        }
    }

    /// Removes every queued entry.
    pub fn clear(&mut self) -> SyncResult<()> {
        self.entries.clear();
        self.persist()
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over queued entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SyncEvent> {
        self.entries.iter()
    }

    fn persist(&self) -> SyncResult<()> {
        let events: Vec<&SyncEvent> = self.entries.iter().collect();
        let text = serde_json::to_string(&events).map_err(|e| {
            SyncError::QueuePersistence(studysync_storage::StorageError::WriteRejected(
                e.to_string(),
            ))
        })?;
        self.store
            .set(&self.key, &text)
            .map_err(SyncError::QueuePersistence)
    }
}
