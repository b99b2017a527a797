//! Request/response API handlers.
//!
//! The device publishes requests on `{prefix}/request/{name}` and the cloud
//! answers on `{prefix}/response/{name}` with an `ApiResponse` envelope.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use iotcore_mqtt::{MessageHandler, MqttResult, PublishOutcome, Publisher, QoS};
use iotcore_protocol::{ApiResponse, ApiTopic, ShadowAccepted, ShadowRejected, topics};

use crate::shadow_sync::SharedShadowState;

/// Publish an empty request for `api`.
pub async fn request<P: Publisher + ?Sized>(
    publisher: &P,
    topic_prefix: &str,
    api: ApiTopic,
) -> MqttResult<PublishOutcome> {
    let topic = topics::request(topic_prefix, api.as_str());
    tracing::debug!(topic = %topic, payload = "{}", "api request");
    publisher.publish(&topic, b"{}".to_vec(), QoS::AtLeastOnce).await
}

/// Handles everything under `{prefix}/response/#`.
pub struct ApiResponseHandler {
    shadow_state: SharedShadowState,
}

impl ApiResponseHandler {
    pub fn new(shadow_state: SharedShadowState) -> Self {
        Self { shadow_state }
    }
}

#[async_trait]
impl MessageHandler for ApiResponseHandler {
    async fn handle(&self, name: &str, payload: Value) {
        let api: ApiTopic = match name.parse() {
            Ok(api) => api,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring response");
                return;
            }
        };
        let response: ApiResponse = match serde_json::from_value(payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(api = %api, error = %e, "response does not match the API envelope");
                return;
            }
        };

        if !response.is_success() {
            tracing::warn!(api = %api, status = ?response.status, message = response.message(), "request not successful");
            return;
        }

        match api {
            ApiTopic::Hello => {
                tracing::info!(message = response.message(), "hello acknowledged");
            }
            ApiTopic::Ping => {
                let now = Utc::now().to_rfc3339();
                tracing::info!(message = response.message(), at = %now, "pong received");
                self.shadow_state.write().await.last_pong_at = Some(now);
            }
        }
    }
}

/// Handles the shadow service's answers under `.../update/#`.
pub struct ShadowResultHandler;

#[async_trait]
impl MessageHandler for ShadowResultHandler {
    async fn handle(&self, name: &str, payload: Value) {
        match name {
            "accepted" => match serde_json::from_value::<ShadowAccepted>(payload) {
                Ok(accepted) => tracing::info!(version = accepted.version, "shadow update accepted"),
                Err(e) => tracing::warn!(error = %e, "unreadable shadow accepted message"),
            },
            "rejected" => match serde_json::from_value::<ShadowRejected>(payload) {
                Ok(rejected) => tracing::warn!(
                    code = rejected.code,
                    message = %rejected.message,
                    "shadow update rejected"
                ),
                Err(e) => tracing::warn!(error = %e, "unreadable shadow rejected message"),
            },
            other => tracing::debug!(kind = other, "shadow notification ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSettings;
    use crate::shadow_sync::DeviceShadowState;
    use iotcore_mqtt::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn request_publishes_empty_object() {
        let mock = MockTransport::new();
        request(&mock, "devices/unit1", ApiTopic::Hello).await.unwrap();

        let msgs = mock.published();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "devices/unit1/request/hello");
        assert_eq!(msgs[0].payload, b"{}");
        assert_eq!(msgs[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn successful_pong_records_time() {
        let state = DeviceShadowState::shared(&AppSettings::default());
        let handler = ApiResponseHandler::new(state.clone());

        handler
            .handle(
                "ping",
                json!({"status": "SUCCEEDED", "response": {"message": "Pong."}}),
            )
            .await;

        assert!(state.read().await.last_pong_at.is_some());
    }

    #[tokio::test]
    async fn failed_ping_leaves_state() {
        let state = DeviceShadowState::shared(&AppSettings::default());
        let handler = ApiResponseHandler::new(state.clone());

        handler.handle("ping", json!({"status": "FAILED"})).await;
        handler.handle("ping", json!({"unexpected": true})).await;
        handler.handle("reboot", json!({"status": "SUCCEEDED"})).await;

        assert!(state.read().await.last_pong_at.is_none());
    }

    #[tokio::test]
    async fn hello_does_not_touch_pong() {
        let state = DeviceShadowState::shared(&AppSettings::default());
        let handler = ApiResponseHandler::new(state.clone());

        handler
            .handle("hello", json!({"status": "SUCCEEDED", "response": {}}))
            .await;

        assert!(state.read().await.last_pong_at.is_none());
    }

    #[tokio::test]
    async fn shadow_results_are_tolerated() {
        let handler = ShadowResultHandler;
        handler.handle("accepted", json!({"version": 7})).await;
        handler
            .handle("rejected", json!({"code": 400, "message": "bad"}))
            .await;
        handler.handle("rejected", json!("garbage")).await;
        handler.handle("documents", json!({})).await;
    }
}
