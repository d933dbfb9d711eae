//! Realtime event dispatcher.
//!
//! Binds the inbound event categories and the channel lifecycle to domain
//! callbacks, and owns the offline queue and [`SyncState`] for outbound
//! events.
//!
//! # Delivery
//!
//! Outbound events go straight to the channel while it is connected and
//! into a bounded drop-oldest queue otherwise. Draining happens on
//! `connect` and on the host's online signal. A send counts as delivered
//! once the channel accepts it; there is no remote acknowledgment, so
//! inbound handlers must tolerate duplicates.

use crate::channel::{DuplexChannel, EventHandler, Subscription};
use crate::config::DispatcherConfig;
use crate::error::{ChannelResult, ConfigError};
use crate::queue::{OfflineQueue, PendingChange, SyncQueueItem, SyncState};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vizsync_protocol::{
    event_names, ConflictResolver, DeviceStatusUpdate, FieldMergeResolver, HealthAlert,
    InboundEvent, PlaylistUpdate, ScheduleExecution,
};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Field added to object payloads so the remote side can correlate them.
pub const EVENT_ID_FIELD: &str = "eventId";

/// Options for a single outbound event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// Track the event as a pending change until the remote side confirms it.
    pub optimistic: bool,
}

impl EmitOptions {
    /// Options for an optimistic event.
    pub fn optimistic() -> Self {
        Self { optimistic: true }
    }
}

/// Outcome of one offline queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items the channel accepted.
    pub delivered: usize,
    /// Items that failed and stay queued.
    pub failed: usize,
    /// Items moved to the conflicted set.
    pub conflicted: usize,
}

/// A remote playlist change that overlapped a pending local one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    /// Event id of the pending change used for the merge.
    pub change_id: String,
    /// Playlist both sides touched.
    pub playlist_id: String,
    /// Local side of the merge.
    pub local: Value,
    /// Remote side of the merge.
    pub remote: Value,
    /// Resolver output.
    pub merged: Value,
}

/// Optional domain callbacks.
///
/// Callbacks run synchronously on the thread that delivered the event,
/// after the dispatcher has released its locks.
#[derive(Default)]
pub struct DispatcherHandlers {
    on_device_status_change: Option<Callback<DeviceStatusUpdate>>,
    on_playlist_change: Option<Callback<PlaylistUpdate>>,
    on_health_alert: Option<Callback<HealthAlert>>,
    on_schedule_execution: Option<Callback<ScheduleExecution>>,
    on_connection_change: Option<Box<dyn Fn(bool) + Send + Sync>>,
    on_sync_state_change: Option<Callback<SyncState>>,
    on_conflict_resolved: Option<Callback<ResolvedConflict>>,
}

impl DispatcherHandlers {
    /// Creates an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every `device:status` event.
    pub fn on_device_status_change(
        mut self,
        f: impl Fn(&DeviceStatusUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_device_status_change = Some(Box::new(f));
        self
    }

    /// Called for every `playlist:updated` event.
    pub fn on_playlist_change(mut self, f: impl Fn(&PlaylistUpdate) + Send + Sync + 'static) -> Self {
        self.on_playlist_change = Some(Box::new(f));
        self
    }

    /// Called for every `health:alert` event.
    pub fn on_health_alert(mut self, f: impl Fn(&HealthAlert) + Send + Sync + 'static) -> Self {
        self.on_health_alert = Some(Box::new(f));
        self
    }

    /// Called for every `schedule:executed` event.
    pub fn on_schedule_execution(
        mut self,
        f: impl Fn(&ScheduleExecution) + Send + Sync + 'static,
    ) -> Self {
        self.on_schedule_execution = Some(Box::new(f));
        self
    }

    /// Called with `true` on `connect` and `false` on `disconnect`.
    pub fn on_connection_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection_change = Some(Box::new(f));
        self
    }

    /// Called with a snapshot after every change to the sync state.
    pub fn on_sync_state_change(mut self, f: impl Fn(&SyncState) + Send + Sync + 'static) -> Self {
        self.on_sync_state_change = Some(Box::new(f));
        self
    }

    /// Called when a remote playlist change was merged with a pending one.
    pub fn on_conflict_resolved(
        mut self,
        f: impl Fn(&ResolvedConflict) + Send + Sync + 'static,
    ) -> Self {
        self.on_conflict_resolved = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for DispatcherHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandlers")
            .field("on_device_status_change", &self.on_device_status_change.is_some())
            .field("on_playlist_change", &self.on_playlist_change.is_some())
            .field("on_health_alert", &self.on_health_alert.is_some())
            .field("on_schedule_execution", &self.on_schedule_execution.is_some())
            .field("on_connection_change", &self.on_connection_change.is_some())
            .field("on_sync_state_change", &self.on_sync_state_change.is_some())
            .field("on_conflict_resolved", &self.on_conflict_resolved.is_some())
            .finish()
    }
}

struct DispatcherInner<C> {
    config: DispatcherConfig,
    channel: C,
    handlers: DispatcherHandlers,
    resolver: Box<dyn ConflictResolver>,
    offline: AtomicBool,
    queue: Mutex<OfflineQueue>,
    sync_state: Mutex<SyncState>,
}

/// Dispatches realtime events between a [`DuplexChannel`] and the domain.
pub struct EventDispatcher<C: DuplexChannel + 'static> {
    inner: Arc<DispatcherInner<C>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<C: DuplexChannel + 'static> EventDispatcher<C> {
    /// Creates a dispatcher using the field-merge conflict resolver.
    pub fn new(
        config: DispatcherConfig,
        channel: C,
        handlers: DispatcherHandlers,
    ) -> Result<Self, ConfigError> {
        Self::with_resolver(config, channel, handlers, FieldMergeResolver)
    }

    /// Creates a dispatcher with a custom conflict resolver.
    ///
    /// Handlers are bound immediately unless the config is disabled.
    pub fn with_resolver(
        config: DispatcherConfig,
        channel: C,
        handlers: DispatcherHandlers,
        resolver: impl ConflictResolver + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let offline = !channel.is_connected();
        let inner = Arc::new(DispatcherInner {
            queue: Mutex::new(OfflineQueue::new(config.offline_queue_size)),
            sync_state: Mutex::new(SyncState::new(Instant::now())),
            config,
            channel,
            handlers,
            resolver: Box::new(resolver),
            offline: AtomicBool::new(offline),
        });

        let subscriptions = if inner.config.enabled {
            bind(&inner)
        } else {
            debug!("dispatcher disabled, no handlers bound");
            Vec::new()
        };

        Ok(Self {
            inner,
            subscriptions: Mutex::new(subscriptions),
        })
    }

    /// Dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.inner.channel
    }

    /// Serializes `data` and emits it under `event`.
    pub fn emit_event<T: Serialize>(
        &self,
        event: &str,
        data: &T,
        options: EmitOptions,
    ) -> ChannelResult<String> {
        let data = serde_json::to_value(data)?;
        Ok(self.inner.emit(event, data, options))
    }

    /// Emits `data` under `event`, returning the generated event id.
    pub fn emit_custom_event(&self, event: &str, data: Value, options: EmitOptions) -> String {
        self.inner.emit(event, data, options)
    }

    /// Emits an optimistic `device:update`.
    pub fn emit_device_update(&self, update: &DeviceStatusUpdate) -> ChannelResult<String> {
        self.emit_event(event_names::DEVICE_UPDATE, update, EmitOptions::optimistic())
    }

    /// Emits an optimistic `playlist:update`.
    pub fn emit_playlist_update(&self, update: &PlaylistUpdate) -> ChannelResult<String> {
        self.emit_event(event_names::PLAYLIST_UPDATE, update, EmitOptions::optimistic())
    }

    /// Emits an optimistic `schedule:update`.
    pub fn emit_schedule_update(&self, update: &ScheduleExecution) -> ChannelResult<String> {
        self.emit_event(event_names::SCHEDULE_UPDATE, update, EmitOptions::optimistic())
    }

    /// Tries to deliver every queued item. Does nothing while disconnected.
    pub fn sync_offline_queue(&self) -> DrainReport {
        self.inner.drain()
    }

    /// Host environment came back online.
    pub fn handle_host_online(&self) {
        self.inner.host_online();
    }

    /// Host environment went offline.
    pub fn handle_host_offline(&self) {
        info!("host offline, queuing events");
        self.inner.offline.store(true, Ordering::SeqCst);
    }

    /// Returns true while the channel or the host is down.
    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Returns true while the channel can send.
    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    /// Snapshot of the sync state.
    pub fn sync_state(&self) -> SyncState {
        self.inner.sync_state.lock().clone()
    }

    /// Number of queued items.
    pub fn offline_queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Copy of the queued items, oldest first.
    pub fn offline_queue(&self) -> Vec<SyncQueueItem> {
        self.inner.queue.lock().snapshot()
    }

    /// Drops every queued item.
    pub fn clear_offline_queue(&self) {
        let mut queue = self.inner.queue.lock();
        info!(dropped = queue.len(), "clearing offline queue");
        queue.clear();
    }

    /// Items that exhausted their delivery attempts.
    pub fn conflicted_changes(&self) -> Vec<SyncQueueItem> {
        self.inner
            .sync_state
            .lock()
            .conflicted_changes
            .values()
            .cloned()
            .collect()
    }

    /// Removes and returns a conflicted item once it was handled externally.
    pub fn resolve_conflicted(&self, id: &str) -> Option<SyncQueueItem> {
        let item = self
            .inner
            .sync_state
            .lock()
            .conflicted_changes
            .shift_remove(id)?;
        debug!(id, "conflicted change resolved");
        self.inner.notify_sync_state();
        Some(item)
    }

    /// Puts a conflicted item back in the queue with a fresh attempt count.
    ///
    /// Returns false if `id` is not conflicted.
    pub fn requeue_conflicted(&self, id: &str) -> bool {
        let Some(mut item) = self
            .inner
            .sync_state
            .lock()
            .conflicted_changes
            .shift_remove(id)
        else {
            return false;
        };

        item.retry_count = 0;
        self.inner.enqueue(item);
        self.inner.notify_sync_state();
        true
    }

    /// Merges a local change with a remote one using the configured resolver.
    pub fn resolve_conflict(&self, local: &Value, remote: &Value) -> Value {
        self.inner.resolver.resolve(local, remote)
    }

    /// Unbinds every channel handler. Also happens on drop.
    pub fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = std::mem::take(&mut *self.subscriptions.lock());
        if !subscriptions.is_empty() {
            debug!(count = subscriptions.len(), "unbinding dispatcher handlers");
        }
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl<C: DuplexChannel + 'static> fmt::Debug for EventDispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &self.inner.config)
            .field("offline", &self.is_offline())
            .field("queued", &self.offline_queue_len())
            .field("bound", &self.subscriptions.lock().len())
            .finish()
    }
}

fn bind<C: DuplexChannel + 'static>(inner: &Arc<DispatcherInner<C>>) -> Vec<Subscription> {
    let mut subscriptions = Vec::with_capacity(event_names::INBOUND.len() + 2);

    for event in event_names::INBOUND {
        let weak = Arc::downgrade(inner);
        let handler: EventHandler = Arc::new(move |payload: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_inbound(event, payload);
            }
        });
        subscriptions.push(inner.channel.on(event, handler));
    }

    let weak: Weak<DispatcherInner<C>> = Arc::downgrade(inner);
    subscriptions.push(inner.channel.on(
        event_names::CONNECT,
        Arc::new(move |_: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.connected();
            }
        }),
    ));

    let weak: Weak<DispatcherInner<C>> = Arc::downgrade(inner);
    subscriptions.push(inner.channel.on(
        event_names::DISCONNECT,
        Arc::new(move |_: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.disconnected();
            }
        }),
    ));

    subscriptions
}

fn with_event_id(data: &Value, id: &str) -> Value {
    match data {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert(EVENT_ID_FIELD.to_string(), Value::String(id.to_string()));
            Value::Object(fields)
        }
        other => other.clone(),
    }
}

impl<C: DuplexChannel> DispatcherInner<C> {
    fn emit(&self, event: &str, data: Value, options: EmitOptions) -> String {
        let id = format!("{event}_{}", Uuid::new_v4());

        if options.optimistic {
            self.sync_state.lock().pending_changes.insert(
                id.clone(),
                PendingChange {
                    event: event.to_string(),
                    data: data.clone(),
                },
            );
            self.notify_sync_state();
        }

        let payload = with_event_id(&data, &id);
        if self.channel.is_connected() {
            match self.channel.emit(event, payload.clone()) {
                Ok(()) => {
                    debug!(event, id = %id, "event emitted");
                    return id;
                }
                Err(err) => warn!(event, id = %id, error = %err, "emit failed, queuing event"),
            }
        }

        self.enqueue(SyncQueueItem::new(id.clone(), event, payload));
        id
    }

    fn enqueue(&self, item: SyncQueueItem) {
        let (id, event) = (item.id.clone(), item.event.clone());
        let (evicted, queued) = {
            let mut queue = self.queue.lock();
            let evicted = queue.push(item);
            (evicted, queue.len())
        };

        debug!(event = %event, id = %id, queued, "event queued offline");
        if let Some(evicted) = evicted {
            warn!(event = %evicted.event, id = %evicted.id, "offline queue full, dropped oldest event");
        }
    }

    fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.channel.is_connected() {
            debug!("channel not connected, skipping offline queue sync");
            return report;
        }

        let items = self.queue.lock().snapshot();
        info!(items = items.len(), "syncing offline queue");

        for item in items {
            if item.retry_count >= self.config.retry_attempts {
                self.conflict(&item.id);
                report.conflicted += 1;
                continue;
            }

            match self.channel.emit(&item.event, item.data.clone()) {
                Ok(()) => {
                    self.queue.lock().remove(&item.id);
                    debug!(event = %item.event, id = %item.id, "queued event synced");
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(event = %item.event, id = %item.id, error = %err, "failed to sync queued event");
                    let attempts = self.queue.lock().increment_retry(&item.id);
                    if attempts.is_some_and(|attempts| attempts >= self.config.retry_attempts) {
                        self.conflict(&item.id);
                        report.conflicted += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        self.sync_state.lock().last_sync_time = Instant::now();
        self.notify_sync_state();
        report
    }

    fn conflict(&self, id: &str) {
        let Some(item) = self.queue.lock().remove(id) else {
            return;
        };
        warn!(event = %item.event, id, attempts = item.retry_count, "max retries exceeded, moving to conflicted changes");
        self.sync_state
            .lock()
            .conflicted_changes
            .insert(item.id.clone(), item);
    }

    fn connected(&self) {
        self.offline.store(false, Ordering::SeqCst);
        info!("connected, syncing offline queue");
        if let Some(f) = &self.handlers.on_connection_change {
            f(true);
        }
        self.drain();
    }

    fn disconnected(&self) {
        self.offline.store(true, Ordering::SeqCst);
        info!("disconnected, offline mode enabled");
        if let Some(f) = &self.handlers.on_connection_change {
            f(false);
        }
    }

    fn host_online(&self) {
        info!("host online, attempting to sync");
        self.offline.store(false, Ordering::SeqCst);
        if self.channel.is_connected() {
            self.drain();
        }
    }

    fn handle_inbound(&self, event: &str, payload: &Value) {
        let decoded = match InboundEvent::decode(event, payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(event, error = %err, "dropping inbound event");
                return;
            }
        };
        debug!(event = decoded.name(), "inbound event");

        match decoded {
            InboundEvent::DeviceStatus(update) => self.device_status(&update),
            InboundEvent::Playlist(update) => self.playlist_updated(&update),
            InboundEvent::HealthAlert(alert) => {
                if let Some(f) = &self.handlers.on_health_alert {
                    f(&alert);
                }
            }
            InboundEvent::ScheduleExecution(execution) => {
                if let Some(f) = &self.handlers.on_schedule_execution {
                    f(&execution);
                }
            }
        }
    }

    fn device_status(&self, update: &DeviceStatusUpdate) {
        if let Some(f) = &self.handlers.on_device_status_change {
            f(update);
        }

        let confirmed = self
            .sync_state
            .lock()
            .take_pending_matching("deviceId", &update.device_id);
        if !confirmed.is_empty() {
            debug!(device_id = %update.device_id, confirmed = confirmed.len(), "pending device changes confirmed");
            self.notify_sync_state();
        }
    }

    fn playlist_updated(&self, update: &PlaylistUpdate) {
        if let Some(f) = &self.handlers.on_playlist_change {
            f(update);
        }

        let overlapping = self
            .sync_state
            .lock()
            .take_pending_matching("playlistId", &update.playlist_id);
        let Some((change_id, change)) = overlapping.first() else {
            return;
        };

        let local = change
            .data
            .get("payload")
            .cloned()
            .unwrap_or_else(|| change.data.clone());
        let merged = self.resolver.resolve(&local, &update.payload);
        debug!(
            playlist_id = %update.playlist_id,
            overlapping = overlapping.len(),
            "resolved conflict with pending playlist change"
        );

        if let Some(f) = &self.handlers.on_conflict_resolved {
            f(&ResolvedConflict {
                change_id: change_id.clone(),
                playlist_id: update.playlist_id.clone(),
                local,
                remote: update.payload.clone(),
                merged,
            });
        }
        self.notify_sync_state();
    }

    fn notify_sync_state(&self) {
        if let Some(f) = &self.handlers.on_sync_state_change {
            let snapshot = self.sync_state.lock().clone();
            f(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use vizsync_protocol::{DeviceStatus, PlaylistAction};

    fn dispatcher(channel: &MemoryChannel) -> EventDispatcher<MemoryChannel> {
        EventDispatcher::new(
            DispatcherConfig::default(),
            channel.clone(),
            DispatcherHandlers::new(),
        )
        .unwrap()
    }

    fn device_update(device_id: &str) -> DeviceStatusUpdate {
        DeviceStatusUpdate {
            device_id: device_id.into(),
            status: DeviceStatus::Online,
            last_seen: "2024-01-01T00:00:00Z".into(),
            current_playlist_id: None,
        }
    }

    #[test]
    fn connected_emit_adds_event_id() {
        let channel = MemoryChannel::new();
        let dispatcher = dispatcher(&channel);

        let id = dispatcher.emit_custom_event("custom", json!({ "a": 1 }), EmitOptions::default());
        assert!(id.starts_with("custom_"));

        let emitted = channel.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, "custom");
        assert_eq!(emitted[0].1, json!({ "a": 1, "eventId": id }));
        assert_eq!(dispatcher.offline_queue_len(), 0);
        assert!(dispatcher.sync_state().pending_changes.is_empty());
    }

    #[test]
    fn non_object_payload_is_sent_unchanged() {
        let channel = MemoryChannel::new();
        let dispatcher = dispatcher(&channel);

        dispatcher.emit_custom_event("custom", json!([1, 2]), EmitOptions::default());
        assert_eq!(channel.emitted()[0].1, json!([1, 2]));
    }

    #[test]
    fn disconnected_emit_queues() {
        let channel = MemoryChannel::disconnected();
        let dispatcher = dispatcher(&channel);
        assert!(dispatcher.is_offline());

        let id = dispatcher.emit_custom_event("custom", json!({}), EmitOptions::default());
        let queue = dispatcher.offline_queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, id);
        assert_eq!(queue[0].retry_count, 0);
        assert_eq!(queue[0].data[EVENT_ID_FIELD], json!(id));
        assert!(channel.emitted().is_empty());
    }

    #[test]
    fn failed_emit_falls_back_to_queue() {
        let channel = MemoryChannel::new();
        channel.set_fail_emits(true);
        let dispatcher = dispatcher(&channel);

        dispatcher.emit_custom_event("custom", json!({}), EmitOptions::default());
        assert_eq!(dispatcher.offline_queue_len(), 1);
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let channel = MemoryChannel::disconnected();
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default().with_offline_queue_size(3),
            channel.clone(),
            DispatcherHandlers::new(),
        )
        .unwrap();

        let ids: Vec<String> = (0..5)
            .map(|i| dispatcher.emit_custom_event("custom", json!({ "n": i }), EmitOptions::default()))
            .collect();

        let queued: Vec<String> = dispatcher.offline_queue().into_iter().map(|i| i.id).collect();
        assert_eq!(queued, ids[2..].to_vec());
    }

    #[test]
    fn optimistic_emit_tracks_pending_change() {
        let channel = MemoryChannel::new();
        let dispatcher = dispatcher(&channel);

        let id = dispatcher.emit_device_update(&device_update("d1")).unwrap();
        let state = dispatcher.sync_state();
        let pending = &state.pending_changes[&id];
        assert_eq!(pending.event, event_names::DEVICE_UPDATE);
        assert_eq!(pending.data["deviceId"], json!("d1"));
        assert!(pending.data.get(EVENT_ID_FIELD).is_none());
    }

    #[test]
    fn reconnect_drains_queue_in_order() {
        let channel = MemoryChannel::disconnected();
        let connections = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&connections);
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default(),
            channel.clone(),
            DispatcherHandlers::new().on_connection_change(move |up| seen.lock().push(up)),
        )
        .unwrap();

        dispatcher.emit_custom_event("first", json!({}), EmitOptions::default());
        dispatcher.emit_custom_event("second", json!({}), EmitOptions::default());

        channel.connect();

        let events: Vec<String> = channel.emitted().into_iter().map(|(e, _)| e).collect();
        assert_eq!(events, vec!["first", "second"]);
        assert_eq!(dispatcher.offline_queue_len(), 0);
        assert!(!dispatcher.is_offline());

        channel.disconnect();
        assert!(dispatcher.is_offline());
        assert_eq!(*connections.lock(), vec![true, false]);
    }

    #[test]
    fn drain_while_disconnected_is_noop() {
        let channel = MemoryChannel::disconnected();
        let dispatcher = dispatcher(&channel);
        dispatcher.emit_custom_event("custom", json!({}), EmitOptions::default());

        assert_eq!(dispatcher.sync_offline_queue(), DrainReport::default());
        assert_eq!(dispatcher.offline_queue()[0].retry_count, 0);
    }

    #[test]
    fn exhausted_items_become_conflicted() {
        let channel = MemoryChannel::disconnected();
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default().with_retry_attempts(2),
            channel.clone(),
            DispatcherHandlers::new(),
        )
        .unwrap();

        let id = dispatcher.emit_custom_event("custom", json!({}), EmitOptions::default());
        channel.set_fail_emits(true);
        channel.connect();
        assert_eq!(dispatcher.offline_queue()[0].retry_count, 1);

        let report = dispatcher.sync_offline_queue();
        assert_eq!(report, DrainReport { delivered: 0, failed: 0, conflicted: 1 });
        assert_eq!(dispatcher.offline_queue_len(), 0);

        let conflicted = dispatcher.conflicted_changes();
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].id, id);
        assert_eq!(conflicted[0].retry_count, 2);
    }

    #[test]
    fn failed_item_does_not_block_later_items() {
        let channel = MemoryChannel::disconnected();
        let dispatcher = dispatcher(&channel);
        dispatcher.emit_custom_event("a", json!({}), EmitOptions::default());
        dispatcher.emit_custom_event("b", json!({}), EmitOptions::default());

        channel.set_fail_emits(true);
        channel.connect();
        let queue = dispatcher.offline_queue();
        assert!(queue.iter().all(|item| item.retry_count == 1));

        channel.set_fail_emits(false);
        let report = dispatcher.sync_offline_queue();
        assert_eq!(report.delivered, 2);
    }

    #[test]
    fn requeue_and_resolve_conflicted() {
        let channel = MemoryChannel::disconnected();
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default().with_retry_attempts(1),
            channel.clone(),
            DispatcherHandlers::new(),
        )
        .unwrap();

        let first = dispatcher.emit_custom_event("a", json!({}), EmitOptions::default());
        let second = dispatcher.emit_custom_event("b", json!({}), EmitOptions::default());
        channel.set_fail_emits(true);
        channel.connect();
        assert_eq!(dispatcher.conflicted_changes().len(), 2);

        assert!(dispatcher.requeue_conflicted(&first));
        assert!(!dispatcher.requeue_conflicted(&first));
        assert_eq!(dispatcher.offline_queue()[0].retry_count, 0);

        let resolved = dispatcher.resolve_conflicted(&second).unwrap();
        assert_eq!(resolved.event, "b");
        assert!(dispatcher.conflicted_changes().is_empty());

        channel.set_fail_emits(false);
        assert_eq!(dispatcher.sync_offline_queue().delivered, 1);
    }

    #[test]
    fn device_status_confirms_pending_changes() {
        let channel = MemoryChannel::new();
        let statuses = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&statuses);
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default(),
            channel.clone(),
            DispatcherHandlers::new().on_device_status_change(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        dispatcher.emit_device_update(&device_update("d1")).unwrap();
        let other = dispatcher.emit_device_update(&device_update("d2")).unwrap();

        let status = serde_json::to_value(device_update("d1")).unwrap();
        channel.deliver(event_names::DEVICE_STATUS, status.clone());
        channel.deliver(event_names::DEVICE_STATUS, status);

        let state = dispatcher.sync_state();
        assert_eq!(state.pending_changes.len(), 1);
        assert!(state.pending_changes.contains_key(&other));
        assert_eq!(statuses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn playlist_update_merges_with_pending_change() {
        let channel = MemoryChannel::new();
        let resolved = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&resolved);
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default(),
            channel.clone(),
            DispatcherHandlers::new().on_conflict_resolved(move |c| sink.lock().push(c.clone())),
        )
        .unwrap();

        let local = PlaylistUpdate {
            playlist_id: "p1".into(),
            action: PlaylistAction::Updated,
            payload: json!({ "name": "local", "loop": true, "_localTimestamp": 5 }),
        };
        let change_id = dispatcher.emit_playlist_update(&local).unwrap();

        channel.deliver(
            event_names::PLAYLIST_UPDATED,
            json!({
                "playlistId": "p1",
                "action": "updated",
                "payload": { "name": "remote", "_remoteTimestamp": 9 }
            }),
        );

        let resolved = resolved.lock();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].change_id, change_id);
        assert_eq!(
            resolved[0].merged,
            json!({ "name": "remote", "loop": true, "_localTimestamp": 5, "_remoteTimestamp": 9 })
        );
        assert!(dispatcher.sync_state().pending_changes.is_empty());
    }

    #[test]
    fn malformed_inbound_is_dropped() {
        let channel = MemoryChannel::new();
        let alerts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&alerts);
        let _dispatcher = EventDispatcher::new(
            DispatcherConfig::default(),
            channel.clone(),
            DispatcherHandlers::new().on_health_alert(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        channel.deliver(event_names::HEALTH_ALERT, json!({ "deviceId": 3 }));
        assert_eq!(alerts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn host_signals_toggle_offline_and_drain() {
        let channel = MemoryChannel::new();
        let dispatcher = dispatcher(&channel);

        dispatcher.handle_host_offline();
        assert!(dispatcher.is_offline());

        channel.set_fail_emits(true);
        dispatcher.emit_custom_event("custom", json!({}), EmitOptions::default());
        channel.set_fail_emits(false);

        dispatcher.handle_host_online();
        assert!(!dispatcher.is_offline());
        assert_eq!(dispatcher.offline_queue_len(), 0);
        assert_eq!(channel.emitted().len(), 1);
    }

    #[test]
    fn disabled_dispatcher_binds_nothing() {
        let channel = MemoryChannel::new();
        let _dispatcher = EventDispatcher::new(
            DispatcherConfig::default().with_enabled(false),
            channel.clone(),
            DispatcherHandlers::new(),
        )
        .unwrap();

        for event in event_names::INBOUND {
            assert_eq!(channel.handler_count(event), 0);
        }
        assert_eq!(channel.handler_count(event_names::CONNECT), 0);
    }

    #[test]
    fn shutdown_and_drop_unbind() {
        let channel = MemoryChannel::new();
        let dispatcher = dispatcher(&channel);
        assert_eq!(channel.handler_count(event_names::CONNECT), 1);

        dispatcher.shutdown();
        assert_eq!(channel.handler_count(event_names::CONNECT), 0);

        let dispatcher = self::dispatcher(&channel);
        assert_eq!(channel.handler_count(event_names::DEVICE_STATUS), 1);
        drop(dispatcher);
        assert_eq!(channel.handler_count(event_names::DEVICE_STATUS), 0);
    }

    #[test]
    fn sync_state_observer_sees_every_change() {
        let channel = MemoryChannel::new();
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let dispatcher = EventDispatcher::new(
            DispatcherConfig::default(),
            channel.clone(),
            DispatcherHandlers::new()
                .on_sync_state_change(move |state| sink.lock().push(state.pending_changes.len())),
        )
        .unwrap();

        dispatcher.emit_device_update(&device_update("d1")).unwrap();
        channel.deliver(
            event_names::DEVICE_STATUS,
            serde_json::to_value(device_update("d1")).unwrap(),
        );

        assert_eq!(*snapshots.lock(), vec![1, 0]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = EventDispatcher::new(
            DispatcherConfig::default().with_offline_queue_size(0),
            MemoryChannel::new(),
            DispatcherHandlers::new(),
        );
        assert!(result.is_err());
    }
}
