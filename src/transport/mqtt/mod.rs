//! MQTT wire client on rumqttc (MQTT v5)
//!
//! - [`connection`] builds `MqttOptions` from a broker URL and `[mqtt]` config
//! - [`message_handler`] classifies rumqttc events
//! - [`client`] owns the event loop and implements [`WireClient`](crate::transport::WireClient)

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::RumqttcWire;
pub use connection::{parse_broker_url, BrokerEndpoint, MqttError};
pub use message_handler::{EventRoute, MessageHandler};
