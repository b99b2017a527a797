//! Inbound/outbound message values and canonical JSON encoding.

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde::Serialize;

use crate::error::{MqttError, MqttResult};

/// A publish waiting to be sent, either immediately or from the offline queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            enqueued_at: Utc::now(),
        }
    }
}

/// A publish received from the broker. Consumed exactly once by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Result of a publish call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport on the current link.
    Sent,
    /// Buffered in the offline queue for the next drain.
    Queued,
}

/// Serialize `payload` to JSON with object keys in sorted order.
///
/// Going through `serde_json::Value` makes the key order independent of
/// struct field order and map insertion order.
pub fn encode_json<T: Serialize + ?Sized>(payload: &T) -> MqttResult<Vec<u8>> {
    let value =
        serde_json::to_value(payload).map_err(|e| MqttError::Serialization(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| MqttError::Serialization(e.to_string()))
}
