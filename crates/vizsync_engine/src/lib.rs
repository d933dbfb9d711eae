//! # VizSync Engine
//!
//! Resilient client-side synchronization core for VizSync.
//!
//! This crate provides:
//! - Exponential backoff with optional jitter
//! - Circuit breaker (closed → open → half-open → closed)
//! - Error registry with cancellable scheduled retries
//! - Retry engine combining the three
//! - Optimistic state container with commit and rollback
//! - Event dispatcher with an offline queue and conflict resolution
//!
//! ## Architecture
//!
//! Every component owns its state behind its own lock and talks to the
//! others only through their public operations:
//! 1. `RetryEngine` owns one `CircuitBreaker` and one `ErrorRegistry`
//! 2. `OptimisticState` owns one pending-update map
//! 3. `EventDispatcher` owns one `OfflineQueue` and one `SyncState`
//!
//! Observers are invoked synchronously after the owning lock is released.
//!
//! ## Key Invariants
//!
//! - Attempts for one retry id never overlap
//! - An open breaker never invokes the operation
//! - The offline queue never exceeds its bound; the oldest item goes first
//! - Rolling back every pending update restores the pre-update baseline
//! - All state is in memory and lives as long as the owning component

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod breaker;
mod channel;
mod config;
mod dispatcher;
mod error;
mod optimistic;
mod queue;
mod registry;
mod retry;
mod scheduler;

pub use breaker::{CircuitBreaker, CircuitState};
pub use channel::{DuplexChannel, EventHandler, MemoryChannel, Subscription};
pub use config::{CircuitBreakerConfig, DispatcherConfig, RecoveryConfig, RetryConfig};
pub use dispatcher::{
    DispatcherHandlers, DrainReport, EmitOptions, EventDispatcher, ResolvedConflict,
    EVENT_ID_FIELD,
};
pub use error::{ChannelError, ChannelResult, ConfigError, RecoveryError, RecoveryResult};
pub use optimistic::{BatchUpdate, OptimisticObservers, OptimisticState, OptimisticUpdate};
pub use queue::{OfflineQueue, PendingChange, SyncQueueItem, SyncState};
pub use registry::{ErrorInfo, ErrorRegistry};
pub use retry::{RecoveryObservers, RetryEngine};
pub use scheduler::{schedule_after, Cancelled, Fired, ScheduledTask};
pub use vizsync_protocol::Severity;
