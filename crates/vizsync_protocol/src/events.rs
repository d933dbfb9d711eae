//! Realtime events carried over the duplex channel.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event names used on the wire.
pub mod event_names {
    /// A device reported a status change.
    pub const DEVICE_STATUS: &str = "device:status";
    /// A playlist was created, updated, deleted or reordered.
    pub const PLAYLIST_UPDATED: &str = "playlist:updated";
    /// A device raised a health alert.
    pub const HEALTH_ALERT: &str = "health:alert";
    /// A schedule started, completed or failed on a display.
    pub const SCHEDULE_EXECUTED: &str = "schedule:executed";

    /// Channel connected.
    pub const CONNECT: &str = "connect";
    /// Channel disconnected.
    pub const DISCONNECT: &str = "disconnect";

    /// Outbound device change.
    pub const DEVICE_UPDATE: &str = "device:update";
    /// Outbound playlist change.
    pub const PLAYLIST_UPDATE: &str = "playlist:update";
    /// Outbound schedule change.
    pub const SCHEDULE_UPDATE: &str = "schedule:update";

    /// All inbound domain events, in binding order.
    pub const INBOUND: [&str; 4] = [DEVICE_STATUS, PLAYLIST_UPDATED, HEALTH_ALERT, SCHEDULE_EXECUTED];
}

/// Severity shared by health alerts and recorded errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Requires attention now.
    Critical,
    /// Degraded but recoverable.
    Warning,
    /// Informational only.
    Info,
}

impl Severity {
    /// Returns the wire name of this severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    /// Returns true for `Critical`.
    pub fn is_critical(&self) -> bool {
        matches!(self, Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity reported for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is reachable.
    Online,
    /// Device stopped reporting.
    Offline,
}

/// Status change for a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusUpdate {
    /// Device identifier.
    pub device_id: String,
    /// New status.
    pub status: DeviceStatus,
    /// When the device was last seen (ISO-8601).
    pub last_seen: String,
    /// Playlist the device is currently showing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_playlist_id: Option<String>,
}

/// Kind of change applied to a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistAction {
    /// Playlist was created.
    Created,
    /// Playlist fields changed.
    Updated,
    /// Playlist was removed.
    Deleted,
    /// Playlist items changed order.
    ItemsReordered,
}

/// A change to a playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistUpdate {
    /// Playlist identifier.
    pub playlist_id: String,
    /// What happened.
    pub action: PlaylistAction,
    /// Partial playlist carrying the changed fields.
    #[serde(default)]
    pub payload: Value,
}

/// Category of a health alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// CPU usage above threshold.
    HighCpu,
    /// Memory usage above threshold.
    HighMemory,
    /// Storage exhausted.
    DiskFull,
    /// Device went offline.
    Offline,
    /// Device reported an error.
    Error,
}

/// Health notification raised for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    /// Device identifier.
    pub device_id: String,
    /// Alert category.
    pub alert_type: AlertType,
    /// Alert severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// When the alert was raised (ISO-8601).
    pub timestamp: String,
}

/// Phase of a schedule execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionAction {
    /// Execution began.
    Started,
    /// Execution finished.
    Completed,
    /// Execution failed.
    Failed,
}

/// Result of running a schedule on a display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleExecution {
    /// Schedule identifier.
    pub schedule_id: String,
    /// Display the schedule ran on.
    pub display_id: String,
    /// Playlist the schedule activated.
    pub playlist_id: String,
    /// Execution phase.
    pub action: ExecutionAction,
    /// When the phase was reached (ISO-8601).
    pub timestamp: String,
    /// Failure reason, for `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A decoded inbound domain event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `device:status`
    DeviceStatus(DeviceStatusUpdate),
    /// `playlist:updated`
    Playlist(PlaylistUpdate),
    /// `health:alert`
    HealthAlert(HealthAlert),
    /// `schedule:executed`
    ScheduleExecution(ScheduleExecution),
}

impl InboundEvent {
    /// Decodes the payload received under `event`.
    pub fn decode(event: &str, payload: &Value) -> ProtocolResult<Self> {
        let malformed = |source| ProtocolError::MalformedPayload {
            event: event.to_string(),
            source,
        };

        match event {
            event_names::DEVICE_STATUS => DeviceStatusUpdate::deserialize(payload)
                .map(InboundEvent::DeviceStatus)
                .map_err(malformed),
            event_names::PLAYLIST_UPDATED => PlaylistUpdate::deserialize(payload)
                .map(InboundEvent::Playlist)
                .map_err(malformed),
            event_names::HEALTH_ALERT => HealthAlert::deserialize(payload)
                .map(InboundEvent::HealthAlert)
                .map_err(malformed),
            event_names::SCHEDULE_EXECUTED => ScheduleExecution::deserialize(payload)
                .map(InboundEvent::ScheduleExecution)
                .map_err(malformed),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Returns the wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::DeviceStatus(_) => event_names::DEVICE_STATUS,
            InboundEvent::Playlist(_) => event_names::PLAYLIST_UPDATED,
            InboundEvent::HealthAlert(_) => event_names::HEALTH_ALERT,
            InboundEvent::ScheduleExecution(_) => event_names::SCHEDULE_EXECUTED,
        }
    }
}
