//! E2E tests for startup configuration and app shadow reporting.

mod helpers;

use std::time::Duration;

use serde_json::{Value, json};

use helpers::{AGENT_TOML, DeviceHarness, PREFIX, settle};
use iotcore_device::api;
use iotcore_device::config::{AgentConfig, ConfigError};
use iotcore_device::shadow_sync;
use iotcore_mqtt::{MockTransport, MqttConfig, MqttError, Session};
use iotcore_protocol::ApiTopic;

/// A missing endpoint stops startup before the transport is touched.
#[tokio::test]
async fn e2e_missing_endpoint_fails_before_connect() {
    let toml = AGENT_TOML.replace("iot_endpoint", "# iot_endpoint");
    let err = AgentConfig::from_sources(&toml, |_| None).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("iot_endpoint")));

    // The session enforces the same rule if handed an incomplete config.
    let mock = std::sync::Arc::new(MockTransport::new());
    let (session, _rx) = Session::new(MqttConfig::plaintext("", 1883, "unit1"), mock.clone());
    assert!(matches!(session.connect().await, Err(MqttError::Configuration(_))));
    assert_eq!(mock.connect_attempts(), 0);
}

/// TLS without certificate paths is a configuration error.
#[test]
fn e2e_tls_requires_credentials() {
    let toml = AGENT_TOML.replace("use_tls = false", "use_tls = true");
    let err = AgentConfig::from_sources(&toml, |_| None).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("certificate_filename")));
}

/// Startup order: shadow report, then hello.
#[tokio::test(start_paused = true)]
async fn e2e_startup_reports_shadow_then_hello() {
    let h = DeviceHarness::new();
    h.connect().await;

    let client = h.shadow_client();
    let start = tokio::time::Instant::now();
    shadow_sync::report_state(&client, &h.config.shadow_name, &h.shadow_state, start).await;
    api::request(&h.session, PREFIX, ApiTopic::Hello).await.unwrap();

    assert_eq!(
        h.published_topics(),
        vec![
            "$aws/things/unit1/shadow/name/app/update",
            "devices/unit1/request/hello",
        ]
    );

    let body: Value = serde_json::from_slice(&h.mqtt.published()[0].payload).unwrap();
    assert_eq!(body["state"]["reported"]["language"], "en");
    assert_eq!(body["state"]["reported"]["color"], "blue");
    h.shutdown().await;
}

/// Shadow reports made offline are delivered after connecting.
#[tokio::test(start_paused = true)]
async fn e2e_offline_shadow_report_is_queued() {
    let h = DeviceHarness::new();
    let client = h.shadow_client();
    let start = tokio::time::Instant::now();

    let outcome =
        shadow_sync::report_state(&client, &h.config.shadow_name, &h.shadow_state, start).await;
    assert_eq!(outcome, Some(iotcore_mqtt::PublishOutcome::Queued));

    h.connect().await;
    settle().await;
    assert_eq!(
        h.published_topics(),
        vec!["$aws/things/unit1/shadow/name/app/update"]
    );
    h.shutdown().await;
}

/// The pong time shows up in the next periodic report; the shadow
/// service's answers are routed without errors.
#[tokio::test(start_paused = true)]
async fn e2e_periodic_sync_carries_last_pong() {
    let toml = format!("{AGENT_TOML}shadow_sync_interval_secs = 10\n");
    let h = DeviceHarness::with_toml(&toml);
    h.connect().await;

    h.respond("ping", json!({"status": "SUCCEEDED", "response": {"message": "Pong."}}))
        .await;

    let client = h.shadow_client();
    let _ = tokio::time::timeout(
        Duration::from_secs(15),
        shadow_sync::run(
            &client,
            &h.config.shadow_name,
            &h.shadow_state,
            Duration::from_secs(h.config.shadow_sync_interval_secs),
            tokio::time::Instant::now(),
        ),
    )
    .await;

    let reports = h.mqtt.published_to("$aws/things/unit1/shadow/name/app/update");
    assert_eq!(reports.len(), 1);
    let body: Value = serde_json::from_slice(&reports[0].payload).unwrap();
    assert!(body["state"]["reported"]["last_pong_at"].is_string());
    assert!(body["clientToken"].is_string());

    assert!(
        h.mqtt
            .deliver(
                "$aws/things/unit1/shadow/name/app/update/accepted",
                br#"{"version":3}"#,
            )
            .await
    );
    assert!(
        h.mqtt
            .deliver(
                "$aws/things/unit1/shadow/name/app/update/rejected",
                br#"{"code":400,"message":"Missing required node: state"}"#,
            )
            .await
    );
    settle().await;
    assert_eq!(h.session.router().stats().dispatched, 3);
    h.shutdown().await;
}

/// The last will is registered on the prefix's `lastwill` topic.
#[test]
fn e2e_last_will_configured() {
    let config = AgentConfig::from_sources(AGENT_TOML, |_| None).unwrap();
    let will = config.mqtt.last_will.unwrap();
    assert_eq!(will.topic, "devices/unit1/lastwill");
    let payload: Value = serde_json::from_str(&will.payload).unwrap();
    assert_eq!(payload, json!({"client_id": "unit1", "thing_name": "unit1"}));
}
