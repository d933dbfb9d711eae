//! Offline queue of undelivered outbound events and the sync bookkeeping
//! that travels with it.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::time::Instant;

/// An outbound event waiting for the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    /// Generated event id.
    pub id: String,
    /// Event name.
    pub event: String,
    /// Payload, including its `eventId`.
    pub data: Value,
    /// When the event was queued.
    pub timestamp: Instant,
    /// Failed delivery attempts.
    pub retry_count: u32,
}

impl SyncQueueItem {
    /// Creates an item with no delivery attempts.
    pub fn new(id: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            event: event.into(),
            data,
            timestamp: Instant::now(),
            retry_count: 0,
        }
    }
}

/// Bounded FIFO that drops its oldest item when full.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    items: VecDeque<SyncQueueItem>,
    capacity: usize,
}

impl OfflineQueue {
    /// Creates an empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends `item`, returning the item evicted to make room, if any.
    pub fn push(&mut self, item: SyncQueueItem) -> Option<SyncQueueItem> {
        self.items.push_back(item);
        if self.items.len() > self.capacity {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Copy of the queued items, oldest first.
    pub fn snapshot(&self) -> Vec<SyncQueueItem> {
        self.items.iter().cloned().collect()
    }

    /// Removes the item `id`.
    pub fn remove(&mut self, id: &str) -> Option<SyncQueueItem> {
        let index = self.items.iter().position(|item| item.id == id)?;
        self.items.remove(index)
    }

    /// Counts a failed delivery of `id`, returning the new count.
    pub fn increment_retry(&mut self, id: &str) -> Option<u32> {
        let item = self.items.iter_mut().find(|item| item.id == id)?;
        item.retry_count += 1;
        Some(item.retry_count)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every queued item.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// An optimistic outbound change awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Event name it was emitted under.
    pub event: String,
    /// Payload as emitted, without the `eventId`.
    pub data: Value,
}

/// Confirmation and conflict bookkeeping for one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    /// When the offline queue was last drained.
    pub last_sync_time: Instant,
    /// Optimistic changes not yet confirmed, keyed by event id.
    pub pending_changes: IndexMap<String, PendingChange>,
    /// Queue items that exhausted their delivery attempts, keyed by event id.
    pub conflicted_changes: IndexMap<String, SyncQueueItem>,
}

impl SyncState {
    /// Creates empty bookkeeping.
    pub fn new(now: Instant) -> Self {
        Self {
            last_sync_time: now,
            pending_changes: IndexMap::new(),
            conflicted_changes: IndexMap::new(),
        }
    }

    /// Removes every pending change whose payload has `field == value`,
    /// returning them in insertion order.
    pub fn take_pending_matching(&mut self, field: &str, value: &str) -> Vec<(String, PendingChange)> {
        let matching: Vec<String> = self
            .pending_changes
            .iter()
            .filter(|(_, change)| change.data.get(field).and_then(Value::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect();

        matching
            .into_iter()
            .filter_map(|id| {
                self.pending_changes
                    .shift_remove(&id)
                    .map(|change| (id, change))
            })
            .collect()
    }
}
