//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while interpreting channel payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The event name is not one this protocol understands.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The payload did not match the expected shape for its event.
    #[error("malformed payload for {event}: {source}")]
    MalformedPayload {
        /// Event name the payload arrived under.
        event: String,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Returns the event name this error relates to.
    pub fn event(&self) -> &str {
        match self {
            ProtocolError::UnknownEvent(event) => event,
            ProtocolError::MalformedPayload { event, .. } => event,
        }
    }
}
