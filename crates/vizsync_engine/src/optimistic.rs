//! Optimistic state with rollback.
//!
//! Local mutations are applied immediately and remembered as pending
//! updates until the server confirms ([`OptimisticState::commit_optimistic`])
//! or rejects ([`OptimisticState::rollback_optimistic`]) them.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use tokio::time::Instant;
use tracing::debug;

/// A speculative mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticUpdate<T> {
    /// Update id.
    pub id: String,
    /// Value before the update was applied.
    pub previous_state: T,
    /// Value the update produced.
    pub optimistic_state: T,
    /// When the update was applied.
    pub timestamp: Instant,
    /// Caller-supplied details.
    pub metadata: Option<Value>,
}

/// One entry of [`OptimisticState::batch_update`].
pub struct BatchUpdate<T> {
    id: String,
    updater: Box<dyn FnOnce(&T) -> T>,
    metadata: Option<Value>,
}

impl<T> BatchUpdate<T> {
    /// Creates a batch entry.
    pub fn new(id: impl Into<String>, updater: impl FnOnce(&T) -> T + 'static) -> Self {
        Self {
            id: id.into(),
            updater: Box::new(updater),
            metadata: None,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl<T> fmt::Debug for BatchUpdate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchUpdate")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

type UpdateCallback<T> = Box<dyn Fn(&OptimisticUpdate<T>) + Send + Sync>;

/// Observers for commits and rollbacks.
pub struct OptimisticObservers<T> {
    on_commit: Option<UpdateCallback<T>>,
    on_rollback: Option<UpdateCallback<T>>,
}

impl<T> OptimisticObservers<T> {
    /// Creates an empty observer set.
    pub fn new() -> Self {
        Self {
            on_commit: None,
            on_rollback: None,
        }
    }

    /// Called with each committed update.
    pub fn on_commit(mut self, f: impl Fn(&OptimisticUpdate<T>) + Send + Sync + 'static) -> Self {
        self.on_commit = Some(Box::new(f));
        self
    }

    /// Called with each rolled back update.
    pub fn on_rollback(
        mut self,
        f: impl Fn(&OptimisticUpdate<T>) + Send + Sync + 'static,
    ) -> Self {
        self.on_rollback = Some(Box::new(f));
        self
    }
}

impl<T> Default for OptimisticObservers<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner<T> {
    current: T,
    // Pending updates in application order.
    queue: Vec<OptimisticUpdate<T>>,
}

impl<T> Inner<T> {
    fn upsert(&mut self, update: OptimisticUpdate<T>) {
        match self.queue.iter_mut().find(|pending| pending.id == update.id) {
            Some(existing) => *existing = update,
            None => self.queue.push(update),
        }
    }

    fn take(&mut self, id: &str) -> Option<OptimisticUpdate<T>> {
        let index = self.queue.iter().position(|pending| pending.id == id)?;
        Some(self.queue.remove(index))
    }
}

/// A value plus the speculative updates applied on top of it.
///
/// Updaters run while the container is locked; they must not call back
/// into the same container.
pub struct OptimisticState<T> {
    inner: Mutex<Inner<T>>,
    observers: OptimisticObservers<T>,
}

impl<T: Clone> OptimisticState<T> {
    /// Creates a container holding `initial`.
    pub fn new(initial: T) -> Self {
        Self::with_observers(initial, OptimisticObservers::default())
    }

    /// Creates a container that reports to `observers`.
    pub fn with_observers(initial: T, observers: OptimisticObservers<T>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: initial,
                queue: Vec::new(),
            }),
            observers,
        }
    }

    /// Current visible value.
    pub fn state(&self) -> T {
        self.inner.lock().current.clone()
    }

    /// Applies `updater` to the current value and records it as pending.
    ///
    /// Re-applying an id that is still pending replaces that entry in place.
    pub fn update_optimistic(
        &self,
        id: impl Into<String>,
        updater: impl FnOnce(&T) -> T,
        metadata: Option<Value>,
    ) {
        let id = id.into();
        let mut inner = self.inner.lock();
        let previous_state = inner.current.clone();
        let optimistic_state = updater(&previous_state);

        inner.current = optimistic_state.clone();
        inner.upsert(OptimisticUpdate {
            id: id.clone(),
            previous_state,
            optimistic_state,
            timestamp: Instant::now(),
            metadata,
        });
        debug!(id = %id, pending = inner.queue.len(), "optimistic update applied");
    }

    /// Confirms the update `id`. Unknown ids are ignored.
    pub fn commit_optimistic(&self, id: &str) -> bool {
        let committed = self.inner.lock().take(id);
        let Some(update) = committed else {
            return false;
        };

        debug!(id, "optimistic update committed");
        if let Some(on_commit) = &self.observers.on_commit {
            on_commit(&update);
        }
        true
    }

    /// Reverts the update `id` to `fallback`, or to the value it replaced.
    /// Unknown ids are ignored.
    pub fn rollback_optimistic(&self, id: &str, fallback: Option<T>) -> bool {
        let rolled_back = {
            let mut inner = self.inner.lock();
            let update = inner.take(id);
            if let Some(update) = &update {
                inner.current = fallback.unwrap_or_else(|| update.previous_state.clone());
            }
            update
        };
        let Some(update) = rolled_back else {
            return false;
        };

        debug!(id, "optimistic update rolled back");
        if let Some(on_rollback) = &self.observers.on_rollback {
            on_rollback(&update);
        }
        true
    }

    /// Reverts to the value that preceded the earliest pending update and
    /// drops every pending update.
    pub fn rollback_all(&self) -> usize {
        let drained = {
            let mut inner = self.inner.lock();
            let drained = std::mem::take(&mut inner.queue);
            if let Some(first) = drained.first() {
                inner.current = first.previous_state.clone();
            }
            drained
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "all optimistic updates rolled back");
        }
        if let Some(on_rollback) = &self.observers.on_rollback {
            for update in &drained {
                on_rollback(update);
            }
        }
        drained.len()
    }

    /// Applies `updates` in order against the running value.
    ///
    /// Every recorded entry's `previous_state` is the value from before the
    /// whole batch, not the value immediately preceding that entry.
    pub fn batch_update(&self, updates: Vec<BatchUpdate<T>>) {
        let mut inner = self.inner.lock();
        let baseline = inner.current.clone();
        let mut running = baseline.clone();
        let count = updates.len();

        for BatchUpdate {
            id,
            updater,
            metadata,
        } in updates
        {
            running = updater(&running);
            inner.upsert(OptimisticUpdate {
                id,
                previous_state: baseline.clone(),
                optimistic_state: running.clone(),
                timestamp: Instant::now(),
                metadata,
            });
        }

        inner.current = running;
        debug!(count, "optimistic batch applied");
    }

    /// Number of pending updates.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Returns true if any update is pending.
    pub fn has_pending_updates(&self) -> bool {
        !self.inner.lock().queue.is_empty()
    }

    /// Pending update `id`.
    pub fn get_pending(&self, id: &str) -> Option<OptimisticUpdate<T>> {
        self.inner
            .lock()
            .queue
            .iter()
            .find(|pending| pending.id == id)
            .cloned()
    }

    /// Snapshot of pending updates keyed by id, in application order.
    pub fn pending_updates(&self) -> IndexMap<String, OptimisticUpdate<T>> {
        self.inner
            .lock()
            .queue
            .iter()
            .map(|pending| (pending.id.clone(), pending.clone()))
            .collect()
    }

    /// Pending updates in application order.
    pub fn update_queue(&self) -> Vec<OptimisticUpdate<T>> {
        self.inner.lock().queue.clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for OptimisticState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OptimisticState")
            .field("current", &inner.current)
            .field("pending", &inner.queue.len())
            .finish()
    }
}
