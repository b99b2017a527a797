//! Device agent configuration, loadable from TOML with environment overrides.
//!
//! This is the only place credentials and endpoint details enter the
//! process; everything downstream receives a validated `MqttConfig`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use iotcore_mqtt::{LastWillConfig, MqttConfig, SessionSettings};
use iotcore_protocol::topics;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required config value: {0}")]
    Missing(&'static str),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// App preferences reported to the named shadow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub language: String,
    pub color: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            color: "blue".to_string(),
        }
    }
}

/// File layout. Required keys are optional here so environment variables
/// can fill them in.
#[derive(Debug, Deserialize)]
struct RawConfig {
    iot_endpoint: Option<String>,
    iot_thing_name: Option<String>,
    iot_client_id: Option<String>,
    mqtt_topic_prefix: Option<String>,
    certificate_filename: Option<String>,
    private_key_filename: Option<String>,
    certificate_authority_filename: Option<String>,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_use_tls")]
    use_tls: bool,
    #[serde(default)]
    session: SessionSettings,
    #[serde(default)]
    app: AppSettings,
    #[serde(default = "default_shadow_name")]
    shadow_name: String,
    #[serde(default = "default_shadow_sync_interval")]
    shadow_sync_interval_secs: u64,
    #[serde(default = "default_ping_interval")]
    ping_interval_secs: u64,
}

fn default_port() -> u16 {
    8883
}

fn default_use_tls() -> bool {
    true
}

fn default_shadow_name() -> String {
    "app".to_string()
}

fn default_shadow_sync_interval() -> u64 {
    300
}

fn default_ping_interval() -> u64 {
    60
}

/// Top-level configuration for the device agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// IoT Core thing name.
    pub thing_name: String,
    /// Prefix of the request/response/lastwill topics.
    pub topic_prefix: String,
    /// Connection settings, last will included.
    pub mqtt: MqttConfig,
    pub app: AppSettings,
    /// Named shadow the app state is reported to.
    pub shadow_name: String,
    pub shadow_sync_interval_secs: u64,
    pub ping_interval_secs: u64,
}

impl AgentConfig {
    /// Load config from a TOML file, with process environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_sources(&contents, |key| std::env::var(key).ok())
    }

    /// Build config from TOML text and an environment lookup.
    ///
    /// A non-empty environment value wins over the file.
    pub fn from_sources(
        contents: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents)?;
        let lookup = |key: &'static str, var: &str, file: &Option<String>| {
            resolve(key, env(var), file.as_deref())
        };

        let endpoint = lookup("iot_endpoint", "IOT_ENDPOINT", &raw.iot_endpoint)?;
        let thing_name = lookup("iot_thing_name", "THING_NAME", &raw.iot_thing_name)?;
        let client_id = lookup("iot_client_id", "CLIENT_ID", &raw.iot_client_id)?;
        let topic_prefix = lookup("mqtt_topic_prefix", "MQTT_TOPIC_PREFIX", &raw.mqtt_topic_prefix)?;

        let (client_cert_path, client_key_path, ca_cert_path) = if raw.use_tls {
            (
                lookup("certificate_filename", "CERTIFICATE_PATH", &raw.certificate_filename)?,
                lookup("private_key_filename", "PRIV_KEY_PATH", &raw.private_key_filename)?,
                lookup(
                    "certificate_authority_filename",
                    "ROOT_CA_PATH",
                    &raw.certificate_authority_filename,
                )?,
            )
        } else {
            Default::default()
        };

        if raw.shadow_sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "shadow_sync_interval_secs must be at least 1".into(),
            ));
        }
        if raw.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ping_interval_secs must be at least 1".into(),
            ));
        }

        let last_will = LastWillConfig {
            topic: topics::last_will(&topic_prefix),
            payload: serde_json::json!({
                "client_id": client_id,
                "thing_name": thing_name,
            })
            .to_string(),
            retain: false,
        };

        let mqtt = MqttConfig {
            endpoint,
            port: raw.port,
            client_id,
            use_tls: raw.use_tls,
            client_cert_path,
            client_key_path,
            ca_cert_path,
            last_will: Some(last_will),
            session: raw.session,
        };
        mqtt.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            thing_name,
            topic_prefix,
            mqtt,
            app: raw.app,
            shadow_name: raw.shadow_name,
            shadow_sync_interval_secs: raw.shadow_sync_interval_secs,
            ping_interval_secs: raw.ping_interval_secs,
        })
    }
}

fn resolve(
    key: &'static str,
    env: Option<String>,
    file: Option<&str>,
) -> Result<String, ConfigError> {
    env.filter(|v| !v.trim().is_empty())
        .or_else(|| file.map(str::to_string))
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}
