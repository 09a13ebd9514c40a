//! mqttbus - resilient MQTT publish/subscribe bus
//!
//! A client-side bus on top of an external MQTT broker with:
//! - wildcard topic subscriptions (`+`, trailing `#`) with reference-counted
//!   wire subscribes
//! - at-least-once publishing through a durable outbox; events that could
//!   not be sent are replayed under their original id after reconnect
//! - a connection supervisor that reconnects on a fixed interval and
//!   re-subscribes every registered pattern
//! - concurrent, fire-and-forget callback dispatch
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqttbus::{BusOptions, CallbackError, MessageBus};
//! use mqttbus::store::MemoryStore;
//! use mqttbus::transport::mqtt::RumqttcWire;
//! use mqttbus::config::BusConfig;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = BusConfig::for_broker("sensor-gateway", "mqtt://localhost:1883");
//! let wire = Arc::new(RumqttcWire::new("sensor-gateway", config.mqtt.clone(), 256));
//! let bus = MessageBus::new(wire, Arc::new(MemoryStore::new()), BusOptions::from_config(&config));
//!
//! bus.subscribe_fn("sensors/+/temp", |topic, payload| async move {
//!     println!("{topic}: {payload:?}");
//!     Ok::<(), CallbackError>(())
//! })
//! .await?;
//!
//! bus.start().await?;
//! let id = bus.publish("sensors/room1/temp", "21.5").await?;
//! println!("recorded {id}");
//! bus.stop().await;
//! # Ok::<(), mqttbus::BusError>(())
//! # });
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod observability;
pub mod outbox;
pub mod routing;
pub mod store;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use bus::{BusOptions, MessageBus};
pub use config::{BusConfig, ConfigError};
pub use error::{BusError, BusResult};
pub use outbox::{DurableOutbox, PublishPipeline};
pub use routing::{CallbackError, CallbackHandle, MessageCallback, SubscriptionRegistry};
pub use store::{EventId, EventRecord, EventStatus, EventStore};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use transport::{InboundMessage, WireClient};
