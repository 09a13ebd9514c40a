//! Connection supervisor
//!
//! One task owns the wire connection. It connects, retries on a fixed
//! interval, and on every successful connect starts the inbound listener,
//! re-subscribes and replays the outbox, then waits for the listener to end
//! when the connection drops. No other component connects or disconnects
//! the wire.

use crate::error::{BusError, BusResult};
use crate::observability::metrics::BusMetrics;
use crate::outbox::PublishPipeline;
use crate::routing::dispatcher::{Dispatcher, ListenOutcome};
use crate::routing::registry::SubscriptionRegistry;
use crate::store::EventStatus;
use crate::transport::WireClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub mod state;

pub use state::{
    next_state, ConnectionEvent, ConnectionState, ConnectionStateMachine, ReconnectPolicy,
    ReconnectionDecision,
};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub broker_url: String,
    pub policy: ReconnectPolicy,
    /// How long `stop` waits for in-flight callbacks
    pub shutdown_grace: Duration,
}

struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ConnectionSupervisor<W: WireClient> {
    wire: Arc<W>,
    registry: Arc<SubscriptionRegistry<W>>,
    pipeline: Arc<PublishPipeline<W>>,
    dispatcher: Arc<Dispatcher<W>>,
    state: ConnectionStateMachine,
    metrics: Arc<BusMetrics>,
    settings: SupervisorSettings,
    run: Mutex<Option<RunHandle>>,
}

impl<W: WireClient> ConnectionSupervisor<W> {
    pub fn new(
        wire: Arc<W>,
        registry: Arc<SubscriptionRegistry<W>>,
        pipeline: Arc<PublishPipeline<W>>,
        dispatcher: Arc<Dispatcher<W>>,
        state: ConnectionStateMachine,
        metrics: Arc<BusMetrics>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            wire,
            registry,
            pipeline,
            dispatcher,
            state,
            metrics,
            settings,
            run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Spawn the run loop
    pub async fn start(self: &Arc<Self>) -> BusResult<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(BusError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

        *run = Some(RunHandle { shutdown_tx, task });
        info!(broker = %self.settings.broker_url, "Connection supervisor started");
        Ok(())
    }

    /// Stop the run loop and listener, release the connection and give
    /// in-flight callbacks `shutdown_grace` to finish
    ///
    /// Idempotent; returns immediately if the supervisor is not running.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(handle) = run.take() else {
            debug!("Connection supervisor not running");
            return;
        };

        info!("Stopping connection supervisor");
        let _ = handle.shutdown_tx.send(true);
        if let Err(e) = handle.task.await {
            error!("Connection supervisor task failed: {}", e);
        }

        let abandoned = self.dispatcher.drain(self.settings.shutdown_grace).await;
        info!(abandoned_callbacks = abandoned, "Connection supervisor stopped");
    }

    /// Connect, serve and reconnect until `shutdown` becomes `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let span = crate::lifecycle_span!(broker = %self.settings.broker_url);

        async {
            let mut failed_attempts: u32 = 0;

            while !*shutdown.borrow() {
                self.state.apply(ConnectionEvent::ConnectAttempted);
                self.metrics.record_connection_attempt();

                let attempt = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => None,
                    result = self.wire.connect(&self.settings.broker_url) => Some(result),
                };

                match attempt {
                    None => break,
                    Some(Err(e)) => {
                        self.metrics.record_connection_failure();
                        self.state
                            .apply(ConnectionEvent::ConnectFailed(e.to_string()));

                        let shutdown_requested = *shutdown.borrow();
                        match self.settings.policy.decide(failed_attempts, shutdown_requested) {
                            ReconnectionDecision::AbortShutdownRequested => break,
                            ReconnectionDecision::Retry { attempt, delay } => {
                                failed_attempts = attempt;
                                info!(
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    "Retrying MQTT connect after backoff"
                                );
                                if !interruptible_sleep(&mut shutdown, delay).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(())) => {
                        failed_attempts = 0;
                        self.metrics.record_connection_established();
                        self.state.apply(ConnectionEvent::ConnectSucceeded);

                        match self.serve_connection(&mut shutdown).await {
                            ListenOutcome::Shutdown => break,
                            ListenOutcome::ConnectionClosed => {
                                self.metrics.record_connection_lost();
                                self.state.apply(ConnectionEvent::ConnectionLost(
                                    "inbound stream closed".to_string(),
                                ));
                                self.release_wire().await;
                            }
                        }
                    }
                }
            }

            self.finish().await;
        }
        .instrument(span)
        .await
    }

    /// Start the listener, resubscribe and replay, then supervise the
    /// listener until it ends
    ///
    /// The listener runs during resubscribe and replay so inbound traffic
    /// (retained messages in particular) keeps draining while replay waits
    /// on the wire.
    async fn serve_connection(&self, shutdown: &mut watch::Receiver<bool>) -> ListenOutcome {
        let dispatcher = Arc::clone(&self.dispatcher);
        let listener_shutdown = shutdown.clone();
        let mut listener = tokio::spawn(async move { dispatcher.listen(listener_shutdown).await });

        let prepared = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => false,
            _ = self.prepare_connection() => true,
        };
        if !prepared {
            if tokio::time::timeout(self.settings.shutdown_grace, &mut listener)
                .await
                .is_err()
            {
                warn!("Inbound listener did not stop in time, aborting it");
                listener.abort();
            }
            return ListenOutcome::Shutdown;
        }

        match listener.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Inbound listener task failed: {}", e);
                ListenOutcome::ConnectionClosed
            }
        }
    }

    async fn prepare_connection(&self) {
        self.registry.resubscribe_all().await;

        match self
            .pipeline
            .replay(None, Some(EventStatus::unconfirmed()))
            .await
        {
            Ok(summary) if summary.candidates > 0 => info!(
                candidates = summary.candidates,
                sent = summary.sent,
                "Replayed unconfirmed events"
            ),
            Ok(_) => {}
            Err(e) => warn!("Outbox replay failed: {}", e),
        }
    }

    async fn release_wire(&self) {
        if let Err(e) = self.wire.disconnect().await {
            debug!("Releasing wire connection failed: {}", e);
        }
    }

    /// Leave the state machine in `Disconnected`, disconnecting if needed
    async fn finish(&self) {
        let needs_disconnect = matches!(
            self.state.current(),
            ConnectionState::Connected | ConnectionState::Connecting
        );

        self.state.apply(ConnectionEvent::StopRequested);
        if needs_disconnect {
            self.release_wire().await;
            self.state.apply(ConnectionEvent::DisconnectCompleted);
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep for `delay` unless shutdown arrives first; false if interrupted
async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown requested during reconnect backoff");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
