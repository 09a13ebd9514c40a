//! Wire transport abstraction
//!
//! The bus never talks to a broker directly. Everything goes through
//! [`WireClient`], which the rumqttc adapter in [`mqtt`] implements for real
//! brokers and `testing::MockWire` implements for tests.

use async_trait::async_trait;
use bytes::Bytes;

pub use rumqttc::v5::mqttbytes::QoS;

pub mod mqtt;

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Connect/publish/subscribe/receive primitives of an MQTT client
///
/// Only the connection supervisor calls `connect`/`disconnect`. Every other
/// method may be called concurrently from any task.
#[async_trait]
pub trait WireClient: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish a session with the broker; returns once the broker acknowledged it
    async fn connect(&self, broker_url: &str) -> Result<(), Self::Error>;

    /// Close the session and release the underlying connection
    async fn disconnect(&self) -> Result<(), Self::Error>;

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), Self::Error>;

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), Self::Error>;

    /// Wait for the next inbound message
    ///
    /// Returns `None` once the connection is closed. Must be cancel safe.
    async fn next_message(&self) -> Option<InboundMessage>;
}

/// Map the configured numeric QoS level onto the MQTT enum
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
