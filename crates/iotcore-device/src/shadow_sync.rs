//! Periodic shadow state reporter.
//!
//! Reports the device's app preferences and runtime state to the named
//! shadow at a configurable interval, so the cloud keeps an up-to-date view
//! of the device.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time;

use iotcore_mqtt::{PublishOutcome, Publisher, ShadowClient};

use crate::config::AppSettings;

/// Device-side shadow state reported to the cloud.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceShadowState {
    pub language: String,
    pub color: String,
    pub agent_version: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pong_at: Option<String>,
}

/// Shared shadow state, updated by the API response handler.
pub type SharedShadowState = Arc<RwLock<DeviceShadowState>>;

impl DeviceShadowState {
    pub fn new(app: &AppSettings) -> Self {
        Self {
            language: app.language.clone(),
            color: app.color.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: 0,
            last_pong_at: None,
        }
    }

    pub fn shared(app: &AppSettings) -> SharedShadowState {
        Arc::new(RwLock::new(Self::new(app)))
    }
}

/// Run the shadow sync loop, reporting state every `interval`.
///
/// The first report is the caller's job (see `report_state`), so the
/// startup order stays explicit.
pub async fn run<P: Publisher + ?Sized>(
    shadow_client: &ShadowClient<'_, P>,
    shadow_name: &str,
    shadow_state: &SharedShadowState,
    interval: Duration,
    start_time: time::Instant,
) {
    let mut ticker = time::interval(interval);
    // Skip the first tick (fires immediately).
    ticker.tick().await;

    loop {
        ticker.tick().await;
        report_state(shadow_client, shadow_name, shadow_state, start_time).await;
    }
}

/// Publish the current state once. Failures are logged, not returned.
pub async fn report_state<P: Publisher + ?Sized>(
    shadow_client: &ShadowClient<'_, P>,
    shadow_name: &str,
    shadow_state: &SharedShadowState,
    start_time: time::Instant,
) -> Option<PublishOutcome> {
    let snapshot = {
        let mut state = shadow_state.write().await;
        state.uptime_secs = start_time.elapsed().as_secs();
        state.clone()
    };

    match shadow_client.report(shadow_name, &snapshot).await {
        Ok(outcome) => {
            tracing::debug!(
                shadow = shadow_name,
                uptime_secs = snapshot.uptime_secs,
                ?outcome,
                "shadow state reported"
            );
            Some(outcome)
        }
        Err(e) => {
            tracing::warn!(shadow = shadow_name, error = %e, "failed to publish shadow update");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotcore_mqtt::MockTransport;
    use serde_json::Value;

    fn make_shadow_state() -> SharedShadowState {
        DeviceShadowState::shared(&AppSettings::default())
    }

    #[tokio::test]
    async fn initial_report_published() {
        let mock = MockTransport::new();
        let client = ShadowClient::new(&mock, "unit1");
        let state = make_shadow_state();
        let start = time::Instant::now();

        let outcome = report_state(&client, "app", &state, start).await;
        assert_eq!(outcome, Some(PublishOutcome::Sent));

        let msgs = mock.published();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "$aws/things/unit1/shadow/name/app/update");
    }

    #[tokio::test]
    async fn report_contains_expected_fields() {
        let mock = MockTransport::new();
        let client = ShadowClient::new(&mock, "unit1");
        let state = make_shadow_state();
        let start = time::Instant::now();

        report_state(&client, "app", &state, start).await;

        let body: Value = serde_json::from_slice(&mock.published()[0].payload).unwrap();
        let reported = &body["state"]["reported"];
        assert_eq!(reported["language"], "en");
        assert_eq!(reported["color"], "blue");
        assert!(reported.get("agent_version").is_some());
        assert!(reported.get("uptime_secs").is_some());
        assert!(reported.get("last_pong_at").is_none());
    }

    #[tokio::test]
    async fn last_pong_is_reported_once_known() {
        let mock = MockTransport::new();
        let client = ShadowClient::new(&mock, "unit1");
        let state = make_shadow_state();
        state.write().await.last_pong_at = Some("2026-01-01T00:00:00+00:00".into());

        report_state(&client, "app", &state, time::Instant::now()).await;

        let body: Value = serde_json::from_slice(&mock.published()[0].payload).unwrap();
        assert_eq!(
            body["state"]["reported"]["last_pong_at"],
            "2026-01-01T00:00:00+00:00"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_on_interval() {
        let mock = MockTransport::new();
        let client = ShadowClient::new(&mock, "unit1");
        let state = make_shadow_state();
        let start = time::Instant::now();

        let _ = time::timeout(
            Duration::from_secs(25),
            run(&client, "app", &state, Duration::from_secs(10), start),
        )
        .await;

        let msgs = mock.published();
        assert_eq!(msgs.len(), 2);
        let last: Value = serde_json::from_slice(&msgs[1].payload).unwrap();
        assert_eq!(last["state"]["reported"]["uptime_secs"], 20);
    }
}
