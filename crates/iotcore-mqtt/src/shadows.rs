//! AWS IoT Device Shadow MQTT operations.
//!
//! Provides typed helpers for publishing reported state to a named (or the
//! classic) shadow through any `Publisher`.

use rumqttc::QoS;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{MqttError, MqttResult};
use crate::message::{PublishOutcome, encode_json};
use crate::session::Publisher;
use iotcore_protocol::{ShadowUpdateDocument, topics};

/// Shadow operations for one thing, backed by a `Publisher` (session or mock).
pub struct ShadowClient<'a, P: Publisher + ?Sized> {
    publisher: &'a P,
    thing_name: String,
}

impl<'a, P: Publisher + ?Sized> ShadowClient<'a, P> {
    pub fn new(publisher: &'a P, thing_name: impl Into<String>) -> Self {
        Self {
            publisher,
            thing_name: thing_name.into(),
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// Topic the update for `shadow_name` is published on.
    pub fn update_topic(&self, shadow_name: &str) -> String {
        topics::shadow_update(&self.thing_name, shadow_name)
    }

    /// Filter covering the broker's accepted/rejected answers for `shadow_name`.
    pub fn results_filter(&self, shadow_name: &str) -> String {
        topics::shadow_update_results(&self.thing_name, shadow_name)
    }

    /// Publish `{"state":{"reported":<reported>}}` to the shadow's update topic.
    ///
    /// No merge with earlier reports is done; the shadow service does that.
    pub async fn update_shadow(
        &self,
        shadow_name: &str,
        reported: Map<String, Value>,
    ) -> MqttResult<PublishOutcome> {
        let document = ShadowUpdateDocument::new(shadow_name, reported);
        self.publish_document(&document).await
    }

    /// Report any serializable value that maps to a JSON object.
    pub async fn report<T: Serialize + ?Sized>(
        &self,
        shadow_name: &str,
        state: &T,
    ) -> MqttResult<PublishOutcome> {
        let document = ShadowUpdateDocument::from_state(shadow_name, state)
            .map_err(|e| MqttError::Serialization(e.to_string()))?
            .with_client_token();
        self.publish_document(&document).await
    }

    async fn publish_document(
        &self,
        document: &ShadowUpdateDocument,
    ) -> MqttResult<PublishOutcome> {
        let topic = self.update_topic(&document.shadow_name);
        let bytes = encode_json(document)?;
        tracing::debug!(
            topic = %topic,
            payload = %String::from_utf8_lossy(&bytes),
            "shadow update"
        );
        self.publisher.publish(&topic, bytes, QoS::AtLeastOnce).await
    }
}
