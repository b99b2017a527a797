//! Session manager.
//!
//! Owns the connection lifecycle: a supervisor task connects, re-issues
//! subscriptions, drains the offline queue, watches keep-alive probes and
//! reconnects with backoff until `disconnect` is called. Callers publish and
//! subscribe through `Session` without caring whether a link is up.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::message::{InboundMessage, OutboundMessage, PublishOutcome, encode_json};
use crate::queue::OfflineQueue;
use crate::router::{MessageHandler, TopicRouter};
use crate::transport::{LinkLoss, Transport};

/// Buffer between the transport and the router.
const INBOUND_CAPACITY: usize = 64;

/// Extra time `connect`/`disconnect` wait on the supervisor beyond its own timeouts.
const SETTLE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Anything that can publish a payload to a topic.
///
/// Implemented by `Session` for production and by `MockTransport` for tests.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS)
    -> MqttResult<PublishOutcome>;
}

struct Shared {
    config: MqttConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    queue: OfflineQueue,
    router: Arc<TopicRouter>,
    inbound: mpsc::Sender<InboundMessage>,
    subscriptions_changed: Notify,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Session {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session over `transport`. The returned receiver carries every
    /// inbound publish; hand it to `TopicRouter::run` on `router()`.
    pub fn new(
        config: MqttConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            queue: OfflineQueue::from_config(&config),
            router: Arc::new(TopicRouter::new(config.session.unroutable)),
            config,
            transport,
            state,
            inbound,
            subscriptions_changed: Notify::new(),
        };
        let session = Self {
            shared: Arc::new(shared),
            supervisor: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        (session, inbound_rx)
    }

    pub fn config(&self) -> &MqttConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn router(&self) -> Arc<TopicRouter> {
        self.shared.router.clone()
    }

    /// Number of messages waiting in the offline queue.
    pub async fn pending(&self) -> usize {
        self.shared.queue.len().await
    }

    /// Start the connection supervisor and wait for the first attempt to settle.
    ///
    /// Returns `Connected` if the first attempt succeeded, or `Reconnecting`
    /// if it failed and a retry is scheduled. Calling it again while running
    /// is a no-op. A session that was disconnected cannot be reused.
    pub async fn connect(&self) -> MqttResult<ConnectionState> {
        self.shared.config.validate()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(MqttError::SessionClosed);
        }

        let mut status = self.shared.state.subscribe();
        {
            let mut slot = self.supervisor.lock().await;
            if slot.is_some() {
                return Ok(self.state());
            }
            let cancel = CancellationToken::new();
            let task = tokio::spawn(supervise(self.shared.clone(), cancel.clone()));
            *slot = Some(Supervisor { cancel, task });
        }

        let bound = self.shared.config.connect_timeout() + SETTLE_GRACE;
        let settled = timeout(
            bound,
            status.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Reconnecting)
            }),
        )
        .await;
        match settled {
            Ok(Ok(state)) => Ok(*state),
            _ => Ok(self.state()),
        }
    }

    /// Stop the supervisor and close the link. Queued messages are kept but
    /// never sent. Idempotent.
    pub async fn disconnect(&self) -> MqttResult<()> {
        let Some(Supervisor { cancel, task }) = self.supervisor.lock().await.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);
        cancel.cancel();

        let abort = task.abort_handle();
        let bound = self.shared.config.connect_timeout() + SETTLE_GRACE;
        match timeout(bound, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "session supervisor failed"),
            Err(_) => {
                tracing::warn!("session supervisor did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        let pending = self.shared.queue.len().await;
        tracing::info!(pending, "session disconnected");
        Ok(())
    }

    /// Register `handler` for `filter` and subscribe on the live link, or on
    /// the next one if disconnected. Subscriptions survive reconnects.
    pub fn subscribe(&self, filter: &str, handler: Arc<dyn MessageHandler>) -> MqttResult<()> {
        self.subscribe_with_qos(filter, QoS::AtLeastOnce, handler)
    }

    pub fn subscribe_with_qos(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> MqttResult<()> {
        self.shared.router.register(filter, qos, handler)?;
        self.shared.subscriptions_changed.notify_one();
        Ok(())
    }

    /// Publish raw bytes. Sent immediately when connected with an empty
    /// offline queue, queued otherwise.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        let message = OutboundMessage::new(topic, payload, qos);
        let link = (self.state() == ConnectionState::Connected)
            .then_some(self.shared.transport.as_ref());
        let outcome = self.shared.queue.enqueue(message, link).await?;
        tracing::debug!(topic, ?outcome, "publish");
        Ok(outcome)
    }

    /// Publish `payload` as JSON with sorted keys.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        let bytes = encode_json(payload)?;
        tracing::debug!(topic, payload = %String::from_utf8_lossy(&bytes), "publish json");
        self.publish(topic, bytes, qos).await
    }
}

#[async_trait]
impl Publisher for Session {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        Session::publish(self, topic, payload, qos).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.cancel.cancel();
        }
    }
}

// ── Supervisor ────────────────────────────────────────────────

enum LinkExit {
    Cancelled,
    Lost(String),
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "session state");
        }
    }

    /// Subscribe every registered filter not yet issued on this link.
    async fn sync_subscriptions(&self, issued: &mut HashSet<String>) -> MqttResult<()> {
        let op_timeout = self.config.operation_timeout();
        for (filter, qos) in self.router.filters() {
            if issued.contains(&filter) {
                continue;
            }
            match timeout(op_timeout, self.transport.subscribe(&filter, qos)).await {
                Ok(Ok(())) => {
                    tracing::info!(filter = %filter, ?qos, "subscribed");
                    issued.insert(filter);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(MqttError::OperationTimeout(op_timeout)),
            }
        }
        Ok(())
    }

    async fn close_link(&self) {
        match timeout(self.config.connect_timeout(), self.transport.disconnect()).await {
            Ok(Ok(())) => tracing::info!("link closed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error closing link"),
            Err(_) => tracing::warn!("timed out closing link"),
        }
    }
}

async fn supervise(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(shared.config.backoff_policy());
    let connect_timeout = shared.config.connect_timeout();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        shared.set_state(ConnectionState::Connecting);
        tracing::info!(
            endpoint = %shared.config.endpoint,
            port = shared.config.port,
            client_id = %shared.config.client_id,
            attempt,
            "connecting"
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(connect_timeout, shared.transport.connect(shared.inbound.clone())) => result,
        };

        match result {
            Ok(Ok(lost)) => {
                attempt = 0;
                backoff.on_connected(Instant::now());
                let exit = run_link(&shared, &cancel, lost).await;
                if backoff.on_disconnected(Instant::now()) {
                    tracing::debug!("link was stable, backoff reset");
                }
                match exit {
                    LinkExit::Cancelled => {
                        shared.close_link().await;
                        break;
                    }
                    LinkExit::Lost(reason) => tracing::warn!(reason = %reason, "connection lost"),
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, attempt, "connection attempt failed"),
            Err(_) => tracing::warn!(
                timeout_ms = connect_timeout.as_millis() as u64,
                attempt,
                "connection attempt timed out"
            ),
        }

        let delay = backoff.next_delay();
        shared.set_state(ConnectionState::Reconnecting);
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Disconnected);
}

/// Serve one established link until it is lost or the session is cancelled.
async fn run_link(shared: &Arc<Shared>, cancel: &CancellationToken, mut lost: LinkLoss) -> LinkExit {
    let mut issued = HashSet::new();
    if let Err(e) = shared.sync_subscriptions(&mut issued).await {
        return LinkExit::Lost(e.to_string());
    }
    shared.queue.clear_stall();
    shared.set_state(ConnectionState::Connected);
    let pending = shared.queue.len().await;
    tracing::info!(subscriptions = issued.len(), pending, "connected");

    let link = cancel.child_token();
    let _link_guard = link.clone().drop_guard();
    tokio::spawn(drain_queue(shared.clone(), link.clone()));
    let mut liveness = tokio::spawn(monitor_liveness(shared.clone(), link.clone()));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return LinkExit::Cancelled,
            reason = &mut lost => {
                let reason = match reason {
                    Ok(e) => e.to_string(),
                    Err(_) => "transport dropped the link".to_string(),
                };
                return LinkExit::Lost(reason);
            }
            _ = &mut liveness => {
                let missed = shared.config.session.max_missed_probes;
                return LinkExit::Lost(format!("{missed} keep-alive probes missed"));
            }
            () = shared.queue.stalled() => {
                return LinkExit::Lost("outbound send failed with messages queued".to_string());
            }
            _ = shared.subscriptions_changed.notified() => {
                if let Err(e) = shared.sync_subscriptions(&mut issued).await {
                    return LinkExit::Lost(e.to_string());
                }
            }
        }
    }
}

async fn drain_queue(shared: Arc<Shared>, link: CancellationToken) {
    match shared.queue.drain(shared.transport.as_ref(), &link).await {
        Ok(0) => {}
        Ok(sent) => tracing::info!(sent, "offline queue drained"),
        Err(e) => {
            let remaining = shared.queue.len().await;
            tracing::warn!(error = %e, remaining, "offline queue drain interrupted");
        }
    }
}

/// Probe every keep-alive interval. Returns once `max_missed_probes`
/// consecutive probes go unacknowledged, or when the link is cancelled.
async fn monitor_liveness(shared: Arc<Shared>, link: CancellationToken) {
    let interval = shared.config.keepalive();
    let probe_timeout = shared.config.probe_timeout();
    let max_missed = shared.config.session.max_missed_probes;
    let mut missed = 0;

    loop {
        tokio::select! {
            _ = link.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let acked = tokio::select! {
            _ = link.cancelled() => return,
            result = timeout(probe_timeout, shared.transport.probe()) => matches!(result, Ok(Ok(()))),
        };
        if acked {
            missed = 0;
            continue;
        }
        missed += 1;
        tracing::warn!(missed, max_missed, "keep-alive probe missed");
        if missed >= max_missed {
            return;
        }
    }
}
