//! Mock MQTT transport for testing without a real broker.
//!
//! Records all published messages and subscription filters for assertion in
//! tests, and lets a test inject connection failures, link drops, missed
//! probes and inbound publishes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MqttError, MqttResult};
use crate::message::{InboundMessage, PublishOutcome};
use crate::session::Publisher;
use crate::transport::{LinkLoss, Transport};

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

struct MockLink {
    inbound: mpsc::Sender<InboundMessage>,
    lost: oneshot::Sender<MqttError>,
}

/// Mock implementation of the `Transport` trait.
///
/// Stores all publishes and subscriptions in memory for test verification.
/// Thread-safe via `Mutex` (fine for test contexts).
pub struct MockTransport {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    link: Mutex<Option<MockLink>>,
    connect_attempts: AtomicUsize,
    disconnects: AtomicUsize,
    failing_connects: AtomicUsize,
    /// Publishes still allowed before failing; `None` never fails.
    publish_budget: Mutex<Option<usize>>,
    publish_delay: Mutex<Option<Duration>>,
    probe_failure: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            connect_attempts: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            publish_budget: Mutex::new(None),
            publish_delay: Mutex::new(None),
            probe_failure: AtomicBool::new(false),
        }
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Let `n` more publishes succeed, then fail every publish after that.
    pub fn fail_publishes_after(&self, n: usize) {
        *self.publish_budget.lock().unwrap() = Some(n);
    }

    /// Publishes succeed again.
    pub fn heal_publishes(&self) {
        *self.publish_budget.lock().unwrap() = None;
    }

    /// Delay every publish by `delay` before recording it.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.publish_delay.lock().unwrap() = delay;
    }

    /// When set, probes never complete.
    pub fn set_probe_failure(&self, fail: bool) {
        self.probe_failure.store(fail, Ordering::SeqCst);
    }

    /// Simulate the broker dropping the link. Returns false if not connected.
    pub fn drop_connection(&self) -> bool {
        match self.link.lock().unwrap().take() {
            Some(link) => {
                let _ = link
                    .lost
                    .send(MqttError::Connection("connection reset by mock".into()));
                true
            }
            None => false,
        }
    }

    /// Push an inbound publish as if it came from the broker. Returns false
    /// if not connected or the receiver is gone.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let sender = self
            .link
            .lock()
            .unwrap()
            .as_ref()
            .map(|link| link.inbound.clone());
        match sender {
            Some(sender) => sender
                .send(InboundMessage::new(topic, payload))
                .await
                .is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().is_some()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Get all subscription filters.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Check whether a subscription was made to the given filter.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|(f, _)| f == filter)
    }

    /// Clear recorded publishes and subscriptions.
    pub fn reset(&self) {
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }

    fn record(&self, topic: &str, payload: &[u8], qos: QoS) {
        self.published.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
    }

    fn take_publish_budget(&self) -> bool {
        let mut budget = self.publish_budget.lock().unwrap();
        match budget.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, inbound: mpsc::Sender<InboundMessage>) -> MqttResult<LinkLoss> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MqttError::Connection("connection refused by mock".into()));
        }

        let (lost, lost_rx) = oneshot::channel();
        *self.link.lock().unwrap() = Some(MockLink { inbound, lost });
        Ok(lost_rx)
    }

    async fn disconnect(&self) -> MqttResult<()> {
        if self.link.lock().unwrap().take().is_some() {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        let delay = *self.publish_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(MqttError::Connection("not connected".into()));
        }
        if !self.take_publish_budget() {
            return Err(MqttError::Publish("publish rejected by mock".into()));
        }
        self.record(topic, payload, qos);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        if !self.is_connected() {
            return Err(MqttError::Connection("not connected".into()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), qos));
        Ok(())
    }

    async fn probe(&self) -> MqttResult<()> {
        if self.probe_failure.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_connected() {
            Ok(())
        } else {
            Err(MqttError::Connection("not connected".into()))
        }
    }
}

/// Records directly, with no link required. Lets helpers that only need a
/// `Publisher` be tested without a session.
#[async_trait]
impl Publisher for MockTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        self.record(topic, &payload, qos);
        Ok(PublishOutcome::Sent)
    }
}
