//! Error types for the synchronization core.

use thiserror::Error;

/// Result type for retry invocations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Rejected configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ConfigError {
    /// Offending field.
    pub field: &'static str,
    /// Why it was rejected.
    pub message: String,
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Terminal outcome of a `retry` invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    /// The breaker was open; the operation was not invoked.
    #[error("Circuit breaker is OPEN - too many failures")]
    CircuitOpen {
        /// Operation id.
        id: String,
    },

    /// Every permitted attempt failed.
    #[error("Max retry attempts ({attempts}) exceeded for {id}")]
    MaxAttemptsExceeded {
        /// Operation id.
        id: String,
        /// Attempts made.
        attempts: u32,
        /// Message of the last operation failure.
        last_error: String,
    },

    /// The scheduled reattempt was cancelled by clearing the error.
    #[error("retry cancelled for {id}")]
    Cancelled {
        /// Operation id.
        id: String,
    },
}

impl RecoveryError {
    /// Returns the operation id this error belongs to.
    pub fn id(&self) -> &str {
        match self {
            RecoveryError::CircuitOpen { id }
            | RecoveryError::MaxAttemptsExceeded { id, .. }
            | RecoveryError::Cancelled { id } => id,
        }
    }

    /// Returns true for failures reported through `on_failure`.
    ///
    /// Cancellation is caller-initiated and is not one of them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecoveryError::Cancelled { .. })
    }
}

/// Errors raised by a duplex channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is down.
    #[error("channel not connected")]
    NotConnected,

    /// The channel refused to send.
    #[error("failed to emit {event}: {message}")]
    Emit {
        /// Event name.
        event: String,
        /// Failure description.
        message: String,
    },

    /// Payload could not be encoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ChannelError {
    /// Returns true if sending again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::NotConnected | ChannelError::Emit { .. } => true,
            ChannelError::Payload(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_error_display() {
        let err = RecoveryError::CircuitOpen { id: "ping".into() };
        assert!(err.to_string().contains("Circuit breaker is OPEN"));
        assert_eq!(err.id(), "ping");
        assert!(err.is_terminal());

        let err = RecoveryError::MaxAttemptsExceeded {
            id: "ping".into(),
            attempts: 3,
            last_error: "timeout".into(),
        };
        assert_eq!(err.to_string(), "Max retry attempts (3) exceeded for ping");

        let err = RecoveryError::Cancelled { id: "ping".into() };
        assert!(!err.is_terminal());
    }

    #[test]
    fn retryable_channel_errors() {
        assert!(ChannelError::NotConnected.is_retryable());
        assert!(ChannelError::Emit {
            event: "device:update".into(),
            message: "socket closed".into(),
        }
        .is_retryable());

        let source = serde_json::from_str::<u8>("x").unwrap_err();
        assert!(!ChannelError::Payload(source).is_retryable());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::invalid("max_attempts", "must be at least 1");
        assert_eq!(err.to_string(), "invalid max_attempts: must be at least 1");
    }
}
