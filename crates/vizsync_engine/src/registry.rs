//! Registry of in-flight and most recent operation errors.

use crate::scheduler::ScheduledTask;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::time::Instant;
use vizsync_protocol::Severity;

/// The most recent failure of one logical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    /// Operation id.
    pub id: String,
    /// Failure message.
    pub error: String,
    /// How bad it is.
    pub severity: Severity,
    /// When the entry was created.
    pub timestamp: Instant,
    /// Reattempts scheduled so far.
    pub retry_count: u32,
    /// When the last reattempt was scheduled.
    pub last_retry_time: Option<Instant>,
    /// When the next reattempt will run.
    pub next_retry_time: Option<Instant>,
    /// Caller-supplied details.
    pub context: Option<Map<String, Value>>,
}

impl ErrorInfo {
    /// Creates a fresh entry with no retries.
    pub fn new(
        id: impl Into<String>,
        error: impl Into<String>,
        severity: Severity,
        timestamp: Instant,
        context: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            id: id.into(),
            error: error.into(),
            severity,
            timestamp,
            retry_count: 0,
            last_retry_time: None,
            next_retry_time: None,
            context,
        }
    }
}

/// Keyed store of [`ErrorInfo`] plus the retry timers pending for each id.
#[derive(Debug, Default)]
pub struct ErrorRegistry {
    errors: Mutex<HashMap<String, ErrorInfo>>,
    timers: Mutex<HashMap<String, ScheduledTask>>,
}

impl ErrorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or overwrites the entry for `info.id`.
    pub fn record(&self, info: ErrorInfo) {
        self.errors.lock().insert(info.id.clone(), info);
    }

    /// Updates the entry for `id` after a failed attempt that will be retried.
    ///
    /// Creates a `warning` entry if none exists; an existing entry keeps its
    /// severity and creation time. Returns the updated entry.
    pub fn note_retry(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
        now: Instant,
        next_retry_time: Instant,
    ) -> ErrorInfo {
        let mut errors = self.errors.lock();
        let info = errors
            .entry(id.to_string())
            .or_insert_with(|| ErrorInfo::new(id, error, Severity::Warning, now, None));

        info.error = error.to_string();
        info.retry_count = retry_count;
        info.last_retry_time = Some(now);
        info.next_retry_time = Some(next_retry_time);
        info.clone()
    }

    /// Returns the entry for `id`.
    pub fn get(&self, id: &str) -> Option<ErrorInfo> {
        self.errors.lock().get(id).cloned()
    }

    /// Returns a copy of every entry.
    pub fn all(&self) -> HashMap<String, ErrorInfo> {
        self.errors.lock().clone()
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Returns true if any entry is critical.
    pub fn has_critical_errors(&self) -> bool {
        self.errors
            .lock()
            .values()
            .any(|info| info.severity.is_critical())
    }

    /// Removes the entry for `id` and cancels its pending retry timer.
    pub fn remove(&self, id: &str) -> Option<ErrorInfo> {
        if let Some(task) = self.timers.lock().remove(id) {
            task.cancel();
        }
        self.errors.lock().remove(id)
    }

    /// Removes every entry and cancels every pending retry timer.
    pub fn clear(&self) {
        for (_, task) in self.timers.lock().drain() {
            task.cancel();
        }
        self.errors.lock().clear();
    }

    /// Associates the pending retry timer for `id`, cancelling any older one.
    pub fn track_timer(&self, id: &str, task: ScheduledTask) {
        if let Some(previous) = self.timers.lock().insert(id.to_string(), task) {
            previous.cancel();
        }
    }

    /// Forgets the timer for `id` without cancelling it.
    pub fn release_timer(&self, id: &str) {
        self.timers.lock().remove(id);
    }

    /// Returns true if a retry timer is pending for `id`.
    pub fn has_pending_timer(&self, id: &str) -> bool {
        self.timers
            .lock()
            .get(id)
            .is_some_and(|task| !task.is_finished())
    }
}
