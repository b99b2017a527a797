//! Shared test harness for E2E integration tests.
//!
//! Wires the device agent's config, handlers and session onto a
//! `MockTransport`, exercising real code paths across all crate boundaries.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use iotcore_device::api::{ApiResponseHandler, ShadowResultHandler};
use iotcore_device::config::AgentConfig;
use iotcore_device::shadow_sync::{DeviceShadowState, SharedShadowState};
use iotcore_mqtt::{ConnectionState, MockTransport, Session, ShadowClient};
use iotcore_protocol::topics;

pub const PREFIX: &str = "devices/unit1";
pub const THING: &str = "unit1";

/// Plaintext agent config pointing at a local broker.
pub const AGENT_TOML: &str = r#"
iot_endpoint = "localhost"
iot_thing_name = "unit1"
iot_client_id = "unit1"
mqtt_topic_prefix = "devices/unit1"
port = 1883
use_tls = false
"#;

/// Device agent wired to a mock broker link.
pub struct DeviceHarness {
    pub config: AgentConfig,
    /// Broker-side view: what the device published and subscribed to.
    pub mqtt: Arc<MockTransport>,
    pub session: Session,
    pub shadow_state: SharedShadowState,
    router: JoinHandle<()>,
}

impl DeviceHarness {
    /// Build the agent the same way `main` does, without connecting.
    pub fn new() -> Self {
        Self::with_toml(AGENT_TOML)
    }

    pub fn with_toml(toml: &str) -> Self {
        let config = AgentConfig::from_sources(toml, |_| None).expect("valid test config");
        let mqtt = Arc::new(MockTransport::new());
        let (session, inbound) = Session::new(config.mqtt.clone(), mqtt.clone());
        let shadow_state = DeviceShadowState::shared(&config.app);

        session
            .subscribe(
                &topics::response_filter(&config.topic_prefix),
                Arc::new(ApiResponseHandler::new(shadow_state.clone())),
            )
            .unwrap();
        session
            .subscribe(
                &topics::shadow_update_results(&config.thing_name, &config.shadow_name),
                Arc::new(ShadowResultHandler),
            )
            .unwrap();
        let router = tokio::spawn(session.router().run(inbound));

        Self {
            config,
            mqtt,
            session,
            shadow_state,
            router,
        }
    }

    pub async fn connect(&self) -> ConnectionState {
        self.session.connect().await.unwrap()
    }

    pub fn shadow_client(&self) -> ShadowClient<'_, Session> {
        ShadowClient::new(&self.session, &self.config.thing_name)
    }

    /// Simulate a cloud response on `{prefix}/response/{name}`.
    pub async fn respond(&self, name: &str, body: Value) {
        let topic = topics::response(&self.config.topic_prefix, name);
        let payload = serde_json::to_vec(&body).unwrap();
        assert!(self.mqtt.deliver(&topic, &payload).await, "not connected");
        settle().await;
    }

    /// Wait until the session reaches `want`.
    pub async fn wait_for(&self, want: ConnectionState) {
        let mut rx = self.session.watch_state();
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("session never reached {want}"))
            .unwrap();
    }

    /// Topics published so far, in order.
    pub fn published_topics(&self) -> Vec<String> {
        self.mqtt.published().into_iter().map(|m| m.topic).collect()
    }

    pub async fn shutdown(self) {
        self.session.disconnect().await.unwrap();
        self.router.abort();
    }
}

/// Let spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
