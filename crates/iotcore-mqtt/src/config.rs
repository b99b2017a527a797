use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{MqttError, MqttResult};
use crate::queue::OverflowPolicy;
use crate::router::UnroutablePolicy;

const DEFAULT_DRAIN_RATE_HZ: f64 = 2.0;

/// MQTT connection configuration, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname (the AWS IoT data endpoint).
    pub endpoint: String,
    /// Broker port (default 8883 for TLS).
    #[serde(default = "default_port")]
    pub port: u16,
    /// MQTT client ID (should be unique per device).
    pub client_id: String,
    /// Enable TLS (mTLS). When false, connects plaintext (local dev).
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Path to device X.509 certificate (PEM).
    #[serde(default)]
    pub client_cert_path: String,
    /// Path to device private key (PEM).
    #[serde(default)]
    pub client_key_path: String,
    /// Path to CA certificate (e.g., AmazonRootCA1.pem).
    #[serde(default)]
    pub ca_cert_path: String,
    /// Message the broker publishes if the device drops off ungracefully.
    #[serde(default)]
    pub last_will: Option<LastWillConfig>,
    /// Timeouts, backoff, and offline queue tuning.
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

/// Session tuning knobs. Every field has a default, so the table is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval between keep-alive probes.
    pub keepalive_secs: u16,
    /// Consecutive missed probe acknowledgments before the link is dropped.
    pub max_missed_probes: u32,
    pub connect_timeout_secs: u64,
    /// Bound on a single publish/subscribe attempt.
    pub operation_timeout_secs: u64,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// A link up for at least this long resets the backoff on its next drop.
    pub stable_connection_secs: u64,
    /// Offline queue depth: -1 unbounded, 0 disables queueing.
    pub offline_queue_depth: i64,
    pub queue_overflow: OverflowPolicy,
    /// Messages per second sent while draining the offline queue.
    pub drain_rate_hz: f64,
    /// Log level for unroutable and malformed inbound messages.
    pub unroutable: UnroutablePolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            max_missed_probes: 3,
            connect_timeout_secs: 10,
            operation_timeout_secs: 5,
            min_backoff_secs: 1,
            max_backoff_secs: 32,
            stable_connection_secs: 20,
            offline_queue_depth: -1,
            queue_overflow: OverflowPolicy::default(),
            drain_rate_hz: DEFAULT_DRAIN_RATE_HZ,
            unroutable: UnroutablePolicy::default(),
        }
    }
}

fn default_use_tls() -> bool {
    true
}

fn default_port() -> u16 {
    8883
}

impl MqttConfig {
    /// Config for a local broker without TLS. Session settings use defaults.
    pub fn plaintext(
        endpoint: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
            client_id: client_id.into(),
            use_tls: false,
            client_cert_path: String::new(),
            client_key_path: String::new(),
            ca_cert_path: String::new(),
            last_will: None,
            session: SessionSettings::default(),
        }
    }

    /// Check that everything `connect` needs is present and consistent.
    pub fn validate(&self) -> MqttResult<()> {
        require("endpoint", &self.endpoint)?;
        require("client_id", &self.client_id)?;
        if self.port == 0 {
            return Err(MqttError::Configuration("port must be non-zero".into()));
        }
        if self.use_tls {
            require("ca_cert_path", &self.ca_cert_path)?;
            require("client_cert_path", &self.client_cert_path)?;
            require("client_key_path", &self.client_key_path)?;
        }

        let s = &self.session;
        if s.keepalive_secs == 0 {
            return Err(MqttError::Configuration(
                "keepalive_secs must be at least 1".into(),
            ));
        }
        if s.max_missed_probes == 0 {
            return Err(MqttError::Configuration(
                "max_missed_probes must be at least 1".into(),
            ));
        }
        if s.min_backoff_secs == 0 || s.min_backoff_secs > s.max_backoff_secs {
            return Err(MqttError::Configuration(format!(
                "backoff bounds must satisfy 0 < min <= max (got {}..{})",
                s.min_backoff_secs, s.max_backoff_secs
            )));
        }
        if s.offline_queue_depth < -1 {
            return Err(MqttError::Configuration(format!(
                "offline_queue_depth must be -1 or greater (got {})",
                s.offline_queue_depth
            )));
        }
        if checked_drain_interval(s.drain_rate_hz).is_none() {
            return Err(MqttError::Configuration(format!(
                "drain_rate_hz must be positive with a representable interval (got {})",
                s.drain_rate_hz
            )));
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.session.keepalive_secs.into())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.session.operation_timeout_secs)
    }

    /// How long to wait for one probe acknowledgment.
    pub fn probe_timeout(&self) -> Duration {
        self.keepalive() + self.operation_timeout()
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            min: Duration::from_secs(self.session.min_backoff_secs),
            max: Duration::from_secs(self.session.max_backoff_secs),
            stable_threshold: Duration::from_secs(self.session.stable_connection_secs),
        }
    }

    /// `None` means unbounded.
    pub fn queue_capacity(&self) -> Option<usize> {
        usize::try_from(self.session.offline_queue_depth).ok()
    }

    /// Gap between drained messages. A rate rejected by `validate` yields
    /// the default interval.
    pub fn drain_interval(&self) -> Duration {
        checked_drain_interval(self.session.drain_rate_hz)
            .unwrap_or_else(|| Duration::from_secs_f64(1.0 / DEFAULT_DRAIN_RATE_HZ))
    }
}

fn checked_drain_interval(rate_hz: f64) -> Option<Duration> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / rate_hz).ok()
}

fn require(name: &str, value: &str) -> MqttResult<()> {
    if value.trim().is_empty() {
        Err(MqttError::Configuration(format!(
            "missing required value: {name}"
        )))
    } else {
        Ok(())
    }
}
