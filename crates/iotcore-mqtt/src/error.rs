//! MQTT session error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during MQTT session operations.
///
/// Only `Configuration`, `OperationTimeout`, `InvalidPattern`, `QueueFull`
/// and `SessionClosed` reach calling code. Transport failures are absorbed by
/// the reconnect loop. Routing failures are logged by the router.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {}ms", .0.as_millis())]
    OperationTimeout(Duration),

    #[error("malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },

    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("no subscription matches topic '{0}'")]
    Unroutable(String),

    #[error("offline queue full (capacity {0})")]
    QueueFull(usize),

    #[error("session closed")]
    SessionClosed,

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MqttError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;
