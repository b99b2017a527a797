//! IoT Core device agent.
//!
//! Connects to AWS IoT Core over mTLS, says hello, keeps the `app` shadow
//! in sync and pings the cloud until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use iotcore_device::api::{self, ApiResponseHandler, ShadowResultHandler};
use iotcore_device::config::AgentConfig;
use iotcore_device::shadow_sync::{self, DeviceShadowState};
use iotcore_device::ping;
use iotcore_mqtt::{MqttTransport, Session, ShadowClient, Transport};
use iotcore_protocol::{ApiTopic, topics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "iotcore-device starting"
    );

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "iot.toml".to_string());

    let config = AgentConfig::load(&config_path)?;
    tracing::info!(
        thing_name = %config.thing_name,
        client_id = %config.mqtt.client_id,
        endpoint = %config.mqtt.endpoint,
        topic_prefix = %config.topic_prefix,
        "config loaded"
    );

    // ── Session ─────────────────────────────────────────────────
    if !config.mqtt.use_tls {
        tracing::info!("MQTT plaintext mode (no TLS)");
    }
    let transport: Arc<dyn Transport> = Arc::new(MqttTransport::new(&config.mqtt)?);
    let (session, inbound) = Session::new(config.mqtt.clone(), transport);

    let shadow_state = DeviceShadowState::shared(&config.app);
    let shadow_client = ShadowClient::new(&session, &config.thing_name);

    // Subscribe to inbound topics
    session.subscribe(
        &topics::response_filter(&config.topic_prefix),
        Arc::new(ApiResponseHandler::new(shadow_state.clone())),
    )?;
    session.subscribe(
        &shadow_client.results_filter(&config.shadow_name),
        Arc::new(ShadowResultHandler),
    )?;
    let router = tokio::spawn(session.router().run(inbound));

    let state = session.connect().await?;
    tracing::info!(state = %state, "session started");

    // ── Startup messages ────────────────────────────────────────
    let start_time = tokio::time::Instant::now();
    shadow_sync::report_state(&shadow_client, &config.shadow_name, &shadow_state, start_time)
        .await;
    if let Err(e) = api::request(&session, &config.topic_prefix, ApiTopic::Hello).await {
        tracing::warn!(error = %e, "failed to publish hello request");
    }

    tracing::info!("iotcore-device ready");

    tokio::select! {
        // Periodic shadow state sync
        () = shadow_sync::run(
            &shadow_client,
            &config.shadow_name,
            &shadow_state,
            Duration::from_secs(config.shadow_sync_interval_secs),
            start_time,
        ) => {
            tracing::error!("shadow sync loop exited unexpectedly");
        }
        // Periodic ping requests
        () = ping::run(
            &session,
            &config.topic_prefix,
            Duration::from_secs(config.ping_interval_secs),
        ) => {
            tracing::error!("ping loop exited unexpectedly");
        }
        // Graceful shutdown on SIGINT
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    session.disconnect().await?;
    router.abort();
    let stats = session.router().stats();
    tracing::info!(
        dispatched = stats.dispatched,
        unroutable = stats.unroutable,
        malformed = stats.malformed,
        "iotcore-device stopped"
    );
    Ok(())
}
