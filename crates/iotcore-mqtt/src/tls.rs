//! TLS configuration for mTLS connections to AWS IoT Core.
//!
//! Loads the X.509 device certificate, private key, and root CA from PEM
//! files and configures rumqttc's TLS transport.

use rumqttc::{TlsConfiguration, Transport};

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};

/// Build a TLS transport from certificate file paths in the config.
///
/// Uses `TlsConfiguration::Simple` which reads PEM-encoded files:
/// - CA certificate (e.g., AmazonRootCA1.pem)
/// - Device certificate (X.509, issued by AWS IoT)
/// - Device private key
pub fn load_tls_transport(config: &MqttConfig) -> MqttResult<Transport> {
    let ca = read_pem("CA cert", &config.ca_cert_path)?;
    let client_cert = read_pem("client cert", &config.client_cert_path)?;
    let client_key = read_pem("client key", &config.client_key_path)?;

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: Some((client_cert, client_key)),
    }))
}

/// Plain TCP, for local brokers only.
pub fn plaintext_transport() -> Transport {
    Transport::Tcp
}

fn read_pem(what: &str, path: &str) -> MqttResult<Vec<u8>> {
    if path.is_empty() {
        return Err(MqttError::Tls(format!("no path configured for {what}")));
    }
    std::fs::read(path).map_err(|e| MqttError::Tls(format!("failed to read {what} '{path}': {e}")))
}
