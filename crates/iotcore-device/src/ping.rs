//! Periodic ping request.
//!
//! Publishes an empty `ping` request at a configurable interval; the cloud's
//! answer is picked up by `ApiResponseHandler`.

use std::time::Duration;

use tokio::time;

use iotcore_mqtt::Publisher;
use iotcore_protocol::ApiTopic;

use crate::api;

/// Run the ping loop, publishing every `interval`.
///
/// Runs until the task is cancelled.
pub async fn run<P: Publisher + ?Sized>(publisher: &P, topic_prefix: &str, interval: Duration) {
    let mut ticker = time::interval(interval);
    // Skip the first tick (fires immediately).
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match api::request(publisher, topic_prefix, ApiTopic::Ping).await {
            Ok(outcome) => tracing::debug!(?outcome, "ping request sent"),
            Err(e) => tracing::warn!(error = %e, "failed to publish ping request"),
        }
    }
}
