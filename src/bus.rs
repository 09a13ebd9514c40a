//! Message bus facade
//!
//! [`MessageBus`] wires one registry, outbox, pipeline, dispatcher and
//! supervisor together around a single wire client. Nothing is global: two
//! buses in the same process share no state.

use crate::config::{BusConfig, StoreBackend};
use crate::error::{BusError, BusResult};
use crate::observability::health::HealthServer;
use crate::observability::metrics::{BusMetrics, MetricsSnapshot};
use crate::outbox::pipeline::ReplaySummary;
use crate::outbox::{DurableOutbox, PublishPipeline};
use crate::routing::{CallbackError, CallbackHandle, Dispatcher, SubscriptionRegistry};
use crate::store::{DocumentStore, EventId, EventStatus, MemoryStore, SharedStore};
use crate::supervisor::{
    ConnectionState, ConnectionStateMachine, ConnectionSupervisor, ReconnectPolicy,
    SupervisorSettings,
};
use crate::transport::mqtt::RumqttcWire;
use crate::transport::{QoS, WireClient};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Runtime knobs for one bus
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub broker_url: String,
    pub qos: QoS,
    pub reconnect_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl BusOptions {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            qos: QoS::AtLeastOnce,
            reconnect_backoff: ReconnectPolicy::default().backoff,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.mqtt.broker_url.clone())
            .with_qos(config.mqtt.qos())
            .with_reconnect_backoff(config.reconnect_backoff())
            .with_shutdown_grace(config.shutdown_grace())
    }
}

pub struct MessageBus<W: WireClient> {
    registry: Arc<SubscriptionRegistry<W>>,
    pipeline: Arc<PublishPipeline<W>>,
    supervisor: Arc<ConnectionSupervisor<W>>,
    metrics: Arc<BusMetrics>,
}

impl<W: WireClient> MessageBus<W> {
    pub fn new(wire: Arc<W>, store: SharedStore, options: BusOptions) -> Self {
        let metrics = Arc::new(BusMetrics::new());
        let state = ConnectionStateMachine::new();

        let registry = Arc::new(SubscriptionRegistry::new(
            wire.clone(),
            options.qos,
            metrics.clone(),
        ));
        let pipeline = Arc::new(PublishPipeline::new(
            wire.clone(),
            DurableOutbox::new(store),
            state.subscribe(),
            options.qos,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            wire.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            wire,
            registry.clone(),
            pipeline.clone(),
            dispatcher,
            state,
            metrics.clone(),
            SupervisorSettings {
                broker_url: options.broker_url,
                policy: ReconnectPolicy::fixed(options.reconnect_backoff),
                shutdown_grace: options.shutdown_grace,
            },
        ));

        Self {
            registry,
            pipeline,
            supervisor,
            metrics,
        }
    }

    /// Register `callback` under `pattern`
    pub async fn subscribe(&self, pattern: &str, callback: CallbackHandle) -> BusResult<()> {
        self.registry.subscribe(pattern, callback).await
    }

    /// Register an async closure; the returned handle unsubscribes it
    pub async fn subscribe_fn<F, Fut>(&self, pattern: &str, f: F) -> BusResult<CallbackHandle>
    where
        F: Fn(String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        let handle = CallbackHandle::from_fn(f);
        self.registry.subscribe(pattern, handle.clone()).await?;
        Ok(handle)
    }

    /// Remove one callback, or every callback when `callback` is `None`
    pub async fn unsubscribe(&self, pattern: &str, callback: Option<&CallbackHandle>) {
        self.registry.unsubscribe(pattern, callback).await
    }

    /// Record and send; network failures leave the record `Failed` for replay
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> BusResult<EventId> {
        self.pipeline.publish(topic, payload).await
    }

    /// Resend a recorded event under its original id
    pub async fn republish(&self, id: EventId) -> BusResult<EventStatus> {
        self.pipeline.republish_id(id).await
    }

    /// Replay every unconfirmed event now instead of waiting for a reconnect
    pub async fn replay(&self) -> BusResult<ReplaySummary> {
        self.pipeline
            .replay(None, Some(EventStatus::unconfirmed()))
            .await
    }

    pub async fn start(&self) -> BusResult<()> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.is_running().await
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state_receiver()
    }

    /// Wait until the supervisor reports `Connected`; false on timeout
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut state = self.state_receiver();
        tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .is_ok_and(|changed| changed.is_ok())
    }

    pub fn outbox(&self) -> &DurableOutbox {
        self.pipeline.outbox()
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let backlog = self.outbox().backlog().await.ok().map(|n| n as u64);
        self.metrics.snapshot(self.state(), backlog)
    }

    pub fn health_server(&self, client_id: impl Into<String>, port: u16) -> HealthServer {
        HealthServer::new(
            client_id,
            port,
            self.state_receiver(),
            self.metrics.clone(),
            self.outbox().clone(),
        )
    }
}

impl MessageBus<RumqttcWire> {
    /// Build a rumqttc-backed bus with the store selected in `config`
    pub async fn from_config(config: &BusConfig) -> BusResult<Self> {
        config.validate()?;

        let store: SharedStore = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Document => {
                let path = config.store.path.as_ref().ok_or_else(|| {
                    BusError::Config(crate::config::ConfigError::InvalidConfig(
                        "store.path is required for the document backend".to_string(),
                    ))
                })?;
                Arc::new(DocumentStore::open(path).await?)
            }
        };

        let wire = Arc::new(RumqttcWire::new(
            config.client.id.clone(),
            config.mqtt.clone(),
            config.dispatch.inbound_buffer,
        ));

        info!(
            client_id = %config.client.id,
            broker = %config.mqtt.broker_url,
            store = ?config.store.backend,
            "Message bus configured"
        );
        Ok(Self::new(wire, store, BusOptions::from_config(config)))
    }
}
