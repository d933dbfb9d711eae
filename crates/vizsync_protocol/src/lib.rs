//! # VizSync Protocol
//!
//! Realtime event payloads and conflict resolution for VizSync.
//!
//! This crate provides:
//! - Event names shared by both ends of the duplex channel
//! - Typed inbound events (device status, playlist changes, health
//!   alerts, schedule executions)
//! - `Severity` shared by alerts and recorded errors
//! - `ConflictResolver` for reconciling remote changes with pending
//!   local ones
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod events;

pub use conflict::{
    ConflictResolver, FieldMergeResolver, RemoteWinsResolver, LOCAL_TIMESTAMP_FIELD,
    REMOTE_TIMESTAMP_FIELD,
};
pub use error::{ProtocolError, ProtocolResult};
pub use events::{
    event_names, AlertType, DeviceStatus, DeviceStatusUpdate, ExecutionAction, HealthAlert,
    InboundEvent, PlaylistAction, PlaylistUpdate, ScheduleExecution, Severity,
};
