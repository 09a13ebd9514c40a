//! Inbound message dispatcher
//!
//! Pulls messages off the wire in receive order and fans each one out to the
//! matching callbacks. Every callback runs as its own task; the listener
//! never waits for them.

use super::callback::CallbackHandle;
use super::registry::SubscriptionRegistry;
use crate::observability::metrics::BusMetrics;
use crate::transport::{InboundMessage, WireClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// Why a listen loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The wire reported the connection closed
    ConnectionClosed,
    /// Shutdown was signalled
    Shutdown,
}

pub struct Dispatcher<W: WireClient> {
    wire: Arc<W>,
    registry: Arc<SubscriptionRegistry<W>>,
    tasks: Mutex<JoinSet<()>>,
    metrics: Arc<BusMetrics>,
}

impl<W: WireClient> Dispatcher<W> {
    pub fn new(
        wire: Arc<W>,
        registry: Arc<SubscriptionRegistry<W>>,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        Self {
            wire,
            registry,
            tasks: Mutex::new(JoinSet::new()),
            metrics,
        }
    }

    /// Consume inbound messages until the connection closes or `shutdown`
    /// flips to `true` (or its sender is dropped)
    pub async fn listen(&self, mut shutdown: watch::Receiver<bool>) -> ListenOutcome {
        info!("Inbound listener started");

        loop {
            if *shutdown.borrow() {
                return ListenOutcome::Shutdown;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Inbound listener stopping on shutdown");
                        return ListenOutcome::Shutdown;
                    }
                }
                message = self.wire.next_message() => match message {
                    Some(message) => {
                        self.dispatch(message).await;
                    }
                    None => {
                        info!("Inbound listener saw connection close");
                        return ListenOutcome::ConnectionClosed;
                    }
                }
            }
        }
    }

    /// Spawn one task per matching callback; returns how many were spawned
    pub async fn dispatch(&self, message: InboundMessage) -> usize {
        self.metrics.record_message_received();

        let callbacks = self.registry.matching_callbacks(&message.topic).await;
        if callbacks.is_empty() {
            debug!(topic = %message.topic, "No subscriber for inbound message");
            return 0;
        }

        let mut tasks = self.tasks.lock().await;
        reap_finished(&mut tasks);

        for callback in &callbacks {
            self.spawn_callback(&mut tasks, callback.clone(), &message);
        }
        callbacks.len()
    }

    fn spawn_callback(
        &self,
        tasks: &mut JoinSet<()>,
        callback: CallbackHandle,
        message: &InboundMessage,
    ) {
        let topic = message.topic.clone();
        let payload = message.payload.clone();
        let metrics = self.metrics.clone();
        let span = crate::dispatch_span!(topic = %topic, callback_id = callback.id());

        metrics.record_callback_dispatched();
        tasks.spawn(
            async move {
                if let Err(e) = callback.invoke(&topic, payload).await {
                    metrics.record_callback_failure();
                    warn!(topic = %topic, error = %e, "Callback failed");
                }
            }
            .instrument(span),
        );
    }

    /// Callback tasks still running
    pub async fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Wait up to `grace` for running callbacks, then abandon the rest
    ///
    /// Abandoned tasks are detached, not aborted. Returns how many were
    /// abandoned.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return 0;
        }

        let waiting = tasks.len();
        let finished = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
            }
        })
        .await;

        match finished {
            Ok(()) => {
                debug!(callbacks = waiting, "All in-flight callbacks finished");
                0
            }
            Err(_) => {
                let abandoned = tasks.len();
                warn!(
                    abandoned,
                    grace_ms = grace.as_millis() as u64,
                    "Abandoning callbacks still running after shutdown grace"
                );
                tasks.detach_all();
                abandoned
            }
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join_result(result);
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Callback panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::callback::CallbackError;
    use crate::testing::mocks::{MockWire, RecordingCallback};
    use crate::transport::QoS;
    use bytes::Bytes;

    struct Fixture {
        wire: Arc<MockWire>,
        registry: Arc<SubscriptionRegistry<MockWire>>,
        dispatcher: Arc<Dispatcher<MockWire>>,
        metrics: Arc<BusMetrics>,
    }

    async fn fixture() -> Fixture {
        let wire = Arc::new(MockWire::new());
        wire.connect("mqtt://mock").await.unwrap();
        let metrics = Arc::new(BusMetrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            wire.clone(),
            QoS::AtLeastOnce,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(wire.clone(), registry.clone(), metrics.clone()));
        Fixture {
            wire,
            registry,
            dispatcher,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_dispatch_invokes_matching_callbacks_only() {
        let fixture = fixture().await;
        let temp = RecordingCallback::new();
        let other = RecordingCallback::new();
        fixture.registry.subscribe("sensors/+/temp", temp.handle()).await.unwrap();
        fixture.registry.subscribe("actuators/#", other.handle()).await.unwrap();

        let spawned = fixture
            .dispatcher
            .dispatch(InboundMessage::new("sensors/room1/temp", "21.5"))
            .await;
        fixture.dispatcher.drain(Duration::from_secs(1)).await;

        assert_eq!(spawned, 1);
        assert_eq!(
            temp.received().await,
            vec![("sensors/room1/temp".to_string(), Bytes::from_static(b"21.5"))]
        );
        assert_eq!(other.count().await, 0);
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_affect_others() {
        let fixture = fixture().await;
        let failing = RecordingCallback::failing();
        let healthy = RecordingCallback::new();
        fixture.registry.subscribe("a/#", failing.handle()).await.unwrap();
        fixture.registry.subscribe("a/#", healthy.handle()).await.unwrap();
        let panicking = CallbackHandle::from_fn(|_, _| async {
            if true {
                panic!("callback exploded");
            }
            Ok::<(), CallbackError>(())
        });
        fixture.registry.subscribe("a/b", panicking).await.unwrap();

        fixture.dispatcher.dispatch(InboundMessage::new("a/b", "1")).await;
        fixture.dispatcher.dispatch(InboundMessage::new("a/b", "2")).await;
        fixture.dispatcher.drain(Duration::from_secs(1)).await;

        assert_eq!(healthy.count().await, 2);
        assert_eq!(failing.count().await, 2);
        let snapshot = fixture
            .metrics
            .snapshot(crate::supervisor::state::ConnectionState::Connected, None);
        assert_eq!(snapshot.dispatch.received, 2);
        assert_eq!(snapshot.dispatch.callbacks_dispatched, 6);
        assert_eq!(snapshot.dispatch.callback_failures, 2);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_listener() {
        let fixture = fixture().await;
        let slow = RecordingCallback::slow(Duration::from_secs(30));
        let fast = RecordingCallback::new();
        fixture.registry.subscribe("slow", slow.handle()).await.unwrap();
        fixture.registry.subscribe("fast", fast.handle()).await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = {
            let dispatcher = fixture.dispatcher.clone();
            tokio::spawn(async move { dispatcher.listen(shutdown_rx).await })
        };
        fixture.wire.inject("slow", "1");
        fixture.wire.inject("fast", "2");

        assert!(fast.wait_for(1, Duration::from_secs(2)).await);
        assert_eq!(slow.count().await, 0);

        fixture.wire.drop_connection();
        assert_eq!(listener.await.unwrap(), ListenOutcome::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_dispatch_follows_receive_order() {
        let fixture = fixture().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let callback = CallbackHandle::from_fn(move |_, payload: Bytes| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(payload);
                Ok::<(), CallbackError>(())
            }
        });
        fixture.registry.subscribe("seq", callback).await.unwrap();

        for n in 0..20u8 {
            fixture.dispatcher.dispatch(InboundMessage::new("seq", vec![n])).await;
            fixture.dispatcher.drain(Duration::from_secs(1)).await;
        }

        let expected: Vec<Bytes> = (0..20u8).map(|n| Bytes::from(vec![n])).collect();
        assert_eq!(*received.lock().await, expected);
    }

    #[tokio::test]
    async fn test_listen_stops_on_shutdown() {
        let fixture = fixture().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = {
            let dispatcher = fixture.dispatcher.clone();
            tokio::spawn(async move { dispatcher.listen(shutdown_rx).await })
        };

        shutdown_tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_drain_abandons_after_grace() {
        let fixture = fixture().await;
        let slow = RecordingCallback::slow(Duration::from_secs(30));
        fixture.registry.subscribe("slow", slow.handle()).await.unwrap();
        fixture.dispatcher.dispatch(InboundMessage::new("slow", "x")).await;

        let started = tokio::time::Instant::now();
        let abandoned = fixture.dispatcher.drain(Duration::from_millis(50)).await;

        assert_eq!(abandoned, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fixture.dispatcher.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_message_spawns_nothing() {
        let fixture = fixture().await;

        let spawned = fixture
            .dispatcher
            .dispatch(InboundMessage::new("nobody/listens", "x"))
            .await;

        assert_eq!(spawned, 0);
        assert_eq!(fixture.dispatcher.in_flight().await, 0);
    }
}
