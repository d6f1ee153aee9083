//! Link-local transport error types.

use std::time::Duration;

/// Errors that can occur in the serverless_xmpp crate.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// No route to the peer exists and none can be created implicitly.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A bounded wait (stream open, features, round trip) expired.
    #[error("No response within {0:?}")]
    NoResponse(Duration),

    /// Malformed or out-of-order control elements on a stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An optional stream feature could not be negotiated.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Every port in the configured listen range is taken.
    #[error("No port available in range {min}-{max}")]
    BindExhausted { min: u16, max: u16 },

    /// The discovery backend rejected an operation.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Invalid configuration values.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The service has not been started (or was stopped).
    #[error("Service not running")]
    NotRunning,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Shorthand for a [`LinkError::NotConnected`] with a message.
    pub fn not_connected(reason: impl Into<String>) -> Self {
        Self::NotConnected(reason.into())
    }

    /// Shorthand for a [`LinkError::Protocol`] with a message.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Whether the caller can keep using the stream after this error.
    ///
    /// Handshake-phase failures with a safe fallback (uncompressed operation)
    /// are recoverable; everything else tears the stream down or is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnsupportedFeature(_) | Self::NoResponse(_))
    }
}
