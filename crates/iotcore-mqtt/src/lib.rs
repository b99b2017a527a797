//! MQTT session layer for AWS IoT Core devices.
//!
//! - `Session` supervises the connection: reconnect with backoff, keep-alive
//!   probes, re-subscription, and an offline queue drained in FIFO order
//! - `Transport` trait for the wire link (mockable in tests)
//! - `MqttTransport` with TLS (mTLS) for production
//! - `MockTransport` for testing without a broker
//! - `TopicRouter` dispatching inbound publishes to handlers by topic prefix
//! - `ShadowClient` for device shadow updates

pub mod backoff;
pub mod config;
pub mod error;
pub mod message;
pub mod mock;
pub mod queue;
pub mod router;
pub mod session;
pub mod shadows;
pub mod tls;
pub mod transport;

// Re-exports for convenience.
pub use backoff::{Backoff, BackoffPolicy};
pub use config::{LastWillConfig, MqttConfig, SessionSettings};
pub use error::{MqttError, MqttResult};
pub use message::{InboundMessage, OutboundMessage, PublishOutcome, encode_json};
pub use mock::MockTransport;
pub use queue::{OfflineQueue, OverflowPolicy};
pub use router::{MessageHandler, RouterStats, TopicPattern, TopicRouter, UnroutablePolicy};
pub use rumqttc::QoS;
pub use session::{ConnectionState, Publisher, Session};
pub use shadows::ShadowClient;
pub use transport::{LinkLoss, MqttTransport, Transport};
