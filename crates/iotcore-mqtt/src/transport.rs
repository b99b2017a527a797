//! Transport boundary: the wire-level MQTT link the session drives.
//!
//! `Transport` is the seam between the session manager and the network.
//! `MqttTransport` implements it on top of `rumqttc` with mTLS; `MockTransport`
//! implements it in memory for tests.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::message::InboundMessage;
use crate::tls;

/// Resolves with the reason once an established link is lost.
pub type LinkLoss = oneshot::Receiver<MqttError>;

/// Request capacity of each rumqttc client.
const CLIENT_CAPACITY: usize = 64;

// ── Transport trait ───────────────────────────────────────────

/// A single MQTT link to the broker.
///
/// Implementations never retry on their own; reconnection, timeouts and
/// backoff belong to the session manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link. Inbound publishes are pushed onto `inbound` in
    /// arrival order until the link is lost.
    async fn connect(&self, inbound: mpsc::Sender<InboundMessage>) -> MqttResult<LinkLoss>;

    /// Close the current link gracefully.
    async fn disconnect(&self) -> MqttResult<()>;

    /// Publish a raw payload on the current link.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    /// Subscribe to a topic filter on the current link.
    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()>;

    /// Wait for the next liveness acknowledgment from the broker.
    async fn probe(&self) -> MqttResult<()>;
}

// ── MqttTransport ─────────────────────────────────────────────

struct Link {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// `rumqttc`-backed transport connected to AWS IoT Core.
///
/// Every `connect` builds a fresh `AsyncClient`/`EventLoop` pair and polls
/// it until CONNACK, then hands the event loop to a driver task. The driver
/// stops at the first event-loop error so rumqttc never reconnects behind
/// the session's back.
pub struct MqttTransport {
    options: MqttOptions,
    link: Mutex<Option<Link>>,
    /// Bumped on every inbound packet (PINGRESP included).
    activity: watch::Sender<u64>,
}

impl MqttTransport {
    /// Build the transport. With TLS enabled the certificate files are read
    /// here, so a bad path fails at startup rather than on first connect.
    pub fn new(config: &MqttConfig) -> MqttResult<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.endpoint, config.port);
        options.set_keep_alive(config.keepalive());
        options.set_clean_session(true);

        if config.use_tls {
            options.set_transport(tls::load_tls_transport(config)?);
        } else {
            options.set_transport(tls::plaintext_transport());
        }

        if let Some(will) = &config.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        let (activity, _) = watch::channel(0);
        Ok(Self {
            options,
            link: Mutex::new(None),
            activity,
        })
    }

    async fn client(&self) -> MqttResult<AsyncClient> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.client.clone())
            .ok_or_else(|| MqttError::Connection("not connected".into()))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, inbound: mpsc::Sender<InboundMessage>) -> MqttResult<LinkLoss> {
        // Tear down any previous link before opening a new one.
        self.link.lock().await.take();

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), CLIENT_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::debug!(session_present = ack.session_present, "connack received");
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(MqttError::Connection(e.to_string())),
            }
        }

        let (lost_tx, lost_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(eventloop, inbound, self.activity.clone(), lost_tx));
        *self.link.lock().await = Some(Link { client, driver });
        Ok(lost_rx)
    }

    async fn disconnect(&self) -> MqttResult<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        link.client
            .disconnect()
            .await
            .map_err(|e| MqttError::Connection(e.to_string()))?;
        // The driver exits once DISCONNECT has been written.
        let _ = (&mut link.driver).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.client()
            .await?
            .publish(topic, qos, false, payload.to_vec())
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        self.client()
            .await?
            .subscribe(filter, qos)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))
    }

    /// rumqttc sends PINGREQ on its own keep-alive schedule; any inbound
    /// packet after this call counts as the acknowledgment.
    async fn probe(&self) -> MqttResult<()> {
        let mut activity = self.activity.subscribe();
        if self.link.lock().await.is_none() {
            return Err(MqttError::Connection("not connected".into()));
        }
        activity
            .changed()
            .await
            .map_err(|_| MqttError::Connection("transport dropped".into()))
    }
}

/// Poll the event loop until the first error, forwarding inbound publishes.
async fn drive(
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    activity: watch::Sender<u64>,
    lost: oneshot::Sender<MqttError>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(packet)) => {
                activity.send_modify(|n| *n = n.wrapping_add(1));
                match packet {
                    Packet::Publish(publish) => {
                        let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                        if inbound.send(message).await.is_err() {
                            tracing::debug!("inbound receiver dropped, discarding publish");
                        }
                    }
                    Packet::Disconnect => {
                        let _ = lost.send(MqttError::Connection("broker sent DISCONNECT".into()));
                        return;
                    }
                    _ => {}
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = lost.send(MqttError::Connection("client disconnected".into()));
                return;
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT event loop error");
                let _ = lost.send(MqttError::Connection(e.to_string()));
                return;
            }
        }
    }
}
