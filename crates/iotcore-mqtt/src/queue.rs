//! Offline publish queue.
//!
//! Buffers outbound messages while the session has no link and drains them
//! in FIFO order, paced, once it reconnects. The buffer lock is held across
//! each send so a direct publish can never overtake a queued one.
//!
//! A failed send leaves a message stuck behind a live link, so the queue
//! raises a stall flag that the session treats as link loss.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::message::{OutboundMessage, PublishOutcome};
use crate::transport::Transport;

/// What a bounded queue does when full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Fail the publish with `MqttError::QueueFull`.
    Reject,
}

pub struct OfflineQueue {
    buffer: Mutex<VecDeque<OutboundMessage>>,
    /// `None` = unbounded, `Some(0)` = queueing disabled.
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    drain_interval: Duration,
    send_timeout: Duration,
    stalled: AtomicBool,
    stall: Notify,
}

impl OfflineQueue {
    pub fn new(
        capacity: Option<usize>,
        overflow: OverflowPolicy,
        drain_interval: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity,
            overflow,
            drain_interval,
            send_timeout,
            stalled: AtomicBool::new(false),
            stall: Notify::new(),
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(
            config.queue_capacity(),
            config.session.queue_overflow,
            config.drain_interval(),
            config.operation_timeout(),
        )
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.lock().await.is_empty()
    }

    /// Resolves once a send fails with messages left behind. Each stall is
    /// reported once.
    pub async fn stalled(&self) {
        loop {
            let notified = self.stall.notified();
            if self.stalled.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }

    /// Forget a stall raised on a previous link.
    pub fn clear_stall(&self) {
        self.stalled.store(false, Ordering::Release);
    }

    fn mark_stalled(&self) {
        self.stalled.store(true, Ordering::Release);
        self.stall.notify_one();
    }

    /// Copy of the queued messages, oldest first.
    pub async fn snapshot(&self) -> Vec<OutboundMessage> {
        self.buffer.lock().await.iter().cloned().collect()
    }

    /// Send `message` on `link` if one is given and nothing is waiting ahead
    /// of it; otherwise append it to the queue.
    ///
    /// A transport error on the direct send is absorbed, the message is
    /// queued and the queue is marked stalled. A timeout is surfaced and the
    /// message is not retried.
    pub async fn enqueue(
        &self,
        message: OutboundMessage,
        link: Option<&dyn Transport>,
    ) -> MqttResult<PublishOutcome> {
        let mut buffer = self.buffer.lock().await;
        let mut fell_back = false;

        if let Some(transport) = link {
            if buffer.is_empty() {
                let send = transport.publish(&message.topic, &message.payload, message.qos);
                match timeout(self.send_timeout, send).await {
                    Ok(Ok(())) => return Ok(PublishOutcome::Sent),
                    Ok(Err(e)) => {
                        tracing::warn!(topic = %message.topic, error = %e, "send failed, queueing");
                        fell_back = true;
                    }
                    Err(_) => return Err(MqttError::OperationTimeout(self.send_timeout)),
                }
            }
        }

        match self.capacity {
            Some(0) => return Err(MqttError::QueueFull(0)),
            Some(capacity) if buffer.len() >= capacity => match self.overflow {
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = buffer.pop_front() {
                        tracing::warn!(
                            topic = %dropped.topic,
                            enqueued_at = %dropped.enqueued_at,
                            capacity,
                            "offline queue full, dropped oldest message"
                        );
                    }
                }
                OverflowPolicy::Reject => return Err(MqttError::QueueFull(capacity)),
            },
            _ => {}
        }

        buffer.push_back(message);
        tracing::debug!(queued = buffer.len(), "message queued offline");
        if fell_back {
            self.mark_stalled();
        }
        Ok(PublishOutcome::Queued)
    }

    /// Send queued messages in FIFO order, one per `drain_interval`.
    ///
    /// Stops when the queue is empty or `cancel` fires. On a send failure the
    /// failed message goes back to the front, the queue is marked stalled and
    /// the error is returned; the rest stay queued for the next drain.
    /// Returns the number sent.
    pub async fn drain(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> MqttResult<usize> {
        let mut sent = 0;
        loop {
            {
                let mut buffer = self.buffer.lock().await;
                let Some(message) = buffer.pop_front() else {
                    break;
                };
                let send = transport.publish(&message.topic, &message.payload, message.qos);
                match timeout(self.send_timeout, send).await {
                    Ok(Ok(())) => sent += 1,
                    Ok(Err(e)) => {
                        buffer.push_front(message);
                        self.mark_stalled();
                        return Err(e);
                    }
                    Err(_) => {
                        buffer.push_front(message);
                        self.mark_stalled();
                        return Err(MqttError::OperationTimeout(self.send_timeout));
                    }
                }
                if buffer.is_empty() {
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.drain_interval) => {}
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use rumqttc::QoS;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn msg(topic: &str) -> OutboundMessage {
        OutboundMessage::new(topic, b"{}".to_vec(), QoS::AtMostOnce)
    }

    fn queue(capacity: Option<usize>, overflow: OverflowPolicy) -> OfflineQueue {
        OfflineQueue::new(
            capacity,
            overflow,
            Duration::from_millis(500),
            Duration::from_secs(5),
        )
    }

    async fn connected_mock() -> MockTransport {
        let mock = MockTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        mock.connect(tx).await.unwrap();
        mock
    }

    #[tokio::test]
    async fn offline_messages_are_queued() {
        let q = queue(None, OverflowPolicy::DropOldest);
        assert_eq!(q.enqueue(msg("a"), None).await.unwrap(), PublishOutcome::Queued);
        assert_eq!(q.enqueue(msg("b"), None).await.unwrap(), PublishOutcome::Queued);
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn connected_with_empty_queue_sends_directly() {
        let mock = connected_mock().await;
        let q = queue(None, OverflowPolicy::DropOldest);
        let outcome = q.enqueue(msg("a"), Some(&mock)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Sent);
        assert!(q.is_empty().await);
        assert_eq!(mock.published_to("a").len(), 1);
    }

    #[tokio::test]
    async fn connected_with_backlog_appends() {
        let mock = connected_mock().await;
        let q = queue(None, OverflowPolicy::DropOldest);
        q.enqueue(msg("old"), None).await.unwrap();

        let outcome = q.enqueue(msg("new"), Some(&mock)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn failed_direct_send_falls_back_to_queue() {
        let mock = connected_mock().await;
        mock.fail_publishes_after(0);
        let q = queue(None, OverflowPolicy::DropOldest);

        let outcome = q.enqueue(msg("a"), Some(&mock)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(q.len().await, 1);
        timeout(Duration::from_millis(10), q.stalled())
            .await
            .expect("fallback marks the queue stalled");
    }

    #[tokio::test(start_paused = true)]
    async fn stall_is_reported_once_and_clearable() {
        let q = queue(None, OverflowPolicy::DropOldest);
        q.mark_stalled();
        q.stalled().await;
        assert!(timeout(Duration::from_secs(1), q.stalled()).await.is_err());

        q.mark_stalled();
        q.clear_stall();
        assert!(timeout(Duration::from_secs(1), q.stalled()).await.is_err());
    }

    #[tokio::test]
    async fn queueing_while_offline_is_not_a_stall() {
        let q = queue(None, OverflowPolicy::DropOldest);
        q.enqueue(msg("a"), None).await.unwrap();
        assert!(!q.stalled.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_direct_send_times_out() {
        let mock = connected_mock().await;
        mock.set_publish_delay(Some(Duration::from_secs(30)));
        let q = queue(None, OverflowPolicy::DropOldest);

        let err = q.enqueue(msg("a"), Some(&mock)).await.unwrap_err();
        assert!(matches!(err, MqttError::OperationTimeout(d) if d == Duration::from_secs(5)));
        assert!(q.is_empty().await, "timed-out message must not be retried");
    }

    #[tokio::test]
    async fn bounded_drop_oldest() {
        let q = queue(Some(2), OverflowPolicy::DropOldest);
        for topic in ["m1", "m2", "m3"] {
            q.enqueue(msg(topic), None).await.unwrap();
        }
        let topics: Vec<String> = q.snapshot().await.into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn bounded_reject() {
        let q = queue(Some(1), OverflowPolicy::Reject);
        q.enqueue(msg("m1"), None).await.unwrap();
        let err = q.enqueue(msg("m2"), None).await.unwrap_err();
        assert!(matches!(err, MqttError::QueueFull(1)));
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn zero_capacity_disables_queueing() {
        let q = queue(Some(0), OverflowPolicy::DropOldest);
        let err = q.enqueue(msg("m1"), None).await.unwrap_err();
        assert!(matches!(err, MqttError::QueueFull(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_preserves_fifo_and_paces() {
        let mock = connected_mock().await;
        let q = queue(None, OverflowPolicy::DropOldest);
        for topic in ["m1", "m2", "m3"] {
            q.enqueue(msg(topic), None).await.unwrap();
        }

        let start = Instant::now();
        let sent = q.drain(&mock, &CancellationToken::new()).await.unwrap();
        assert_eq!(sent, 3);
        assert!(q.is_empty().await);

        let topics: Vec<String> = mock.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["m1", "m2", "m3"]);
        // Two gaps of 500ms between three messages at 2 Hz.
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_failure_requeues_at_front() {
        let mock = connected_mock().await;
        mock.fail_publishes_after(1);
        let q = queue(None, OverflowPolicy::DropOldest);
        for topic in ["m1", "m2", "m3"] {
            q.enqueue(msg(topic), None).await.unwrap();
        }

        let err = q.drain(&mock, &CancellationToken::new()).await;
        assert!(err.is_err());

        let remaining: Vec<String> = q.snapshot().await.into_iter().map(|m| m.topic).collect();
        assert_eq!(remaining, vec!["m2", "m3"]);
        assert_eq!(mock.published().len(), 1);
        assert!(q.stalled.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_drain_keeps_rest() {
        let mock = connected_mock().await;
        let q = queue(None, OverflowPolicy::DropOldest);
        for topic in ["m1", "m2"] {
            q.enqueue(msg(topic), None).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sent = q.drain(&mock, &cancel).await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(q.len().await, 1);
    }
}
