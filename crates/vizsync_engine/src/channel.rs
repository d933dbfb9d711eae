//! Duplex channel abstraction.
//!
//! The core makes no assumption about the transport beyond the four
//! operations of [`DuplexChannel`]. Lifecycle changes arrive as the
//! `connect` and `disconnect` events.

use crate::error::{ChannelError, ChannelResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use vizsync_protocol::event_names;

/// Handler invoked with the payload of an inbound event.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// A bidirectional event channel.
pub trait DuplexChannel: Send + Sync {
    /// Returns true while the channel can send.
    fn is_connected(&self) -> bool;

    /// Sends `payload` under `event`. Success means the channel accepted the
    /// event, not that the remote side received it.
    fn emit(&self, event: &str, payload: Value) -> ChannelResult<()>;

    /// Registers `handler` for `event` until the subscription is dropped.
    fn on(&self, event: &str, handler: EventHandler) -> Subscription;
}

/// Registration of a handler on a channel.
///
/// Dropping the subscription unregisters the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription that runs `unsubscribe` once.
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unregisters the handler now.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

type HandlerTable = HashMap<String, Vec<(u64, EventHandler)>>;

#[derive(Default)]
struct MemoryChannelInner {
    connected: AtomicBool,
    fail_emits: AtomicBool,
    next_handler_id: AtomicU64,
    handlers: Mutex<HandlerTable>,
    emitted: Mutex<Vec<(String, Value)>>,
}

/// An in-process channel for tests and demos.
///
/// Clones share the same channel, so a test can keep one handle to drive
/// inbound events and lifecycle changes while a dispatcher owns another.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<MemoryChannelInner>,
}

impl MemoryChannel {
    /// Creates a connected channel.
    pub fn new() -> Self {
        let channel = Self::default();
        channel.inner.connected.store(true, Ordering::SeqCst);
        channel
    }

    /// Creates a disconnected channel.
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Marks the channel connected and fires `connect`.
    pub fn connect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        self.deliver(event_names::CONNECT, Value::Null);
    }

    /// Marks the channel disconnected and fires `disconnect`.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.deliver(event_names::DISCONNECT, Value::Null);
    }

    /// Makes subsequent emits fail while `fail` is true.
    pub fn set_fail_emits(&self, fail: bool) {
        self.inner.fail_emits.store(fail, Ordering::SeqCst);
    }

    /// Invokes every handler registered for `event`.
    pub fn deliver(&self, event: &str, payload: Value) {
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .lock()
            .get(event)
            .map(|registered| registered.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(&payload);
        }
    }

    /// Events accepted so far, in order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.inner.emitted.lock().clone()
    }

    /// Forgets recorded emits.
    pub fn clear_emitted(&self) {
        self.inner.emitted.lock().clear();
    }

    /// Number of handlers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .lock()
            .get(event)
            .map_or(0, |registered| registered.len())
    }
}

impl DuplexChannel for MemoryChannel {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, payload: Value) -> ChannelResult<()> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        if self.inner.fail_emits.load(Ordering::SeqCst) {
            return Err(ChannelError::Emit {
                event: event.to_string(),
                message: "emit rejected".into(),
            });
        }

        self.inner.emitted.lock().push((event.to_string(), payload));
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) -> Subscription {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));

        let inner: Weak<MemoryChannelInner> = Arc::downgrade(&self.inner);
        let event = event.to_string();
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut handlers = inner.handlers.lock();
                if let Some(registered) = handlers.get_mut(&event) {
                    registered.retain(|(handler_id, _)| *handler_id != id);
                }
            }
        })
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("connected", &self.is_connected())
            .field("emitted", &self.inner.emitted.lock().len())
            .finish()
    }
}
