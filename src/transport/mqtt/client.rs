//! rumqttc-backed wire client
//!
//! `connect` polls the event loop until CONNACK, then hands the event loop to
//! a pump task. The pump forwards inbound publishes into a bounded channel
//! read by `next_message` and keeps rumqttc's request queue moving while the
//! supervisor resubscribes and replays. When the pump exits the channel
//! closes, which is how the listener learns the connection is gone.
//!
//! `publish` returns only once the broker has acknowledged the packet
//! (PUBACK for QoS 1, PUBCOMP for QoS 2). The pump matches rumqttc's
//! outgoing publish events to waiting callers in request order and
//! completes them by packet id. Every connect starts a clean session, so
//! when the pump exits the waiters still pending are failed.

use super::connection::{configure_mqtt_options, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{InboundMessage, QoS, WireClient};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// Capacity of rumqttc's outgoing request queue
const REQUEST_CAPACITY: usize = 64;

/// How long `disconnect` waits for the DISCONNECT packet to be flushed
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

struct AckWaiter {
    qos: QoS,
    done: oneshot::Sender<()>,
}

/// Publishes handed to rumqttc whose callers are still waiting
#[derive(Default)]
struct AckTracker {
    /// Requested but not yet written, in request-queue order
    queued: VecDeque<AckWaiter>,
    /// Held back by rumqttc until its packet id is free again
    deferred: Option<AckWaiter>,
    /// Written and waiting for PUBACK/PUBCOMP; more than one per id only
    /// while a packet id collision resolves
    in_flight: HashMap<u16, VecDeque<oneshot::Sender<()>>>,
}

impl AckTracker {
    fn written(&mut self, packet_id: u16) {
        let Some(waiter) = self.deferred.take().or_else(|| self.queued.pop_front()) else {
            trace!(packet_id, "Publish written with no caller waiting");
            return;
        };
        if waiter.qos == QoS::AtMostOnce {
            let _ = waiter.done.send(());
        } else {
            self.in_flight
                .entry(packet_id)
                .or_default()
                .push_back(waiter.done);
        }
    }

    fn deferred(&mut self, packet_id: u16) {
        debug!(packet_id, "Publish waiting for packet id to be released");
        self.deferred = self.queued.pop_front();
    }

    fn acknowledged(&mut self, packet_id: u16) {
        let Some(waiters) = self.in_flight.get_mut(&packet_id) else {
            trace!(packet_id, "Acknowledgement with no caller waiting");
            return;
        };
        if let Some(done) = waiters.pop_front() {
            let _ = done.send(());
        }
        if waiters.is_empty() {
            self.in_flight.remove(&packet_id);
        }
    }

    /// Drop every waiter; their callers see the publish as failed
    fn abandon(&mut self) -> usize {
        let pending = self.queued.len()
            + usize::from(self.deferred.is_some())
            + self.in_flight.values().map(VecDeque::len).sum::<usize>();
        *self = Self::default();
        pending
    }
}

struct Session {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    /// Keeps waiter registration in the same order as rumqttc's queue
    publish_order: Arc<Mutex<()>>,
    stop_tx: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

/// Handles a publish needs, cloned out of the session
struct PublishHandles {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    publish_order: Arc<Mutex<()>>,
}

pub struct RumqttcWire {
    client_id: String,
    config: MqttSection,
    inbound_buffer: usize,
    connected: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl RumqttcWire {
    pub fn new(client_id: impl Into<String>, config: MqttSection, inbound_buffer: usize) -> Self {
        Self {
            client_id: client_id.into(),
            config,
            inbound_buffer: inbound_buffer.max(1),
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            inbound: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn client(&self) -> Result<AsyncClient, MqttError> {
        Ok(self.publish_handles().await?.client)
    }

    async fn publish_handles(&self) -> Result<PublishHandles, MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| PublishHandles {
                client: session.client.clone(),
                acks: session.acks.clone(),
                publish_order: session.publish_order.clone(),
            })
            .ok_or(MqttError::NotConnected)
    }

    /// Stop the pump of the current session, if any, and drop its client
    async fn release_session(&self) {
        let session = self.session.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut session) = session {
            let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
                if session.client.disconnect().await.is_ok() {
                    let _ = (&mut session.pump).await;
                }
            })
            .await;
            if flushed.is_err() {
                debug!("DISCONNECT not flushed in time, stopping event pump");
            }

            let _ = session.stop_tx.send(true);
            if !session.pump.is_finished() {
                let _ = session.pump.await;
            }
        }

        self.inbound.lock().await.take();
    }
}

#[async_trait]
impl WireClient for RumqttcWire {
    type Error = MqttError;

    async fn connect(&self, broker_url: &str) -> Result<(), Self::Error> {
        self.release_session().await;

        let span = crate::mqtt_span!(operation = "connect", broker = %broker_url);
        async {
            let options = configure_mqtt_options(&self.client_id, broker_url, &self.config)?;
            let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

            let timeout = self.config.connect_timeout();
            tokio::time::timeout(timeout, wait_for_connack(&mut event_loop))
                .await
                .map_err(|_| MqttError::ConnectTimeout(timeout))??;

            let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_buffer);
            let (stop_tx, stop_rx) = watch::channel(false);
            let acks = Arc::new(Mutex::new(AckTracker::default()));
            self.connected.store(true, Ordering::SeqCst);
            let pump = tokio::spawn(pump_events(
                event_loop,
                inbound_tx,
                acks.clone(),
                stop_rx,
                self.connected.clone(),
            ));

            *self.inbound.lock().await = Some(inbound_rx);
            *self.session.lock().await = Some(Session {
                client,
                acks,
                publish_order: Arc::new(Mutex::new(())),
                stop_tx,
                pump,
            });

            info!(broker = %broker_url, "Connected to MQTT broker");
            Ok::<(), MqttError>(())
        }
        .instrument(span)
        .await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.release_session().await;
        debug!("MQTT session released");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), Self::Error> {
        self.client()
            .await?
            .subscribe(pattern.to_string(), qos)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        self.client()
            .await?
            .unsubscribe(pattern.to_string())
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), Self::Error> {
        let handles = self.publish_handles().await?;
        let (done_tx, done_rx) = oneshot::channel();

        {
            let _order = handles.publish_order.lock().await;
            handles
                .acks
                .lock()
                .await
                .queued
                .push_back(AckWaiter { qos, done: done_tx });

            if let Err(e) = handles
                .client
                .publish(topic.to_string(), qos, false, payload)
                .await
            {
                handles.acks.lock().await.queued.pop_back();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
        }

        let timeout = self.config.ack_timeout();
        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::NotAcknowledged),
            Err(_) => Err(MqttError::AckTimeout(timeout)),
        }
    }

    async fn next_message(&self) -> Option<InboundMessage> {
        let mut inbound = self.inbound.lock().await;
        match inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

/// Poll until the broker acknowledges the session
async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        let event = event_loop
            .poll()
            .await
            .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged { accepted: true, .. } => return Ok(()),
            EventRoute::ConnectionAcknowledged { accepted: false, reason } => {
                return Err(MqttError::ConnectionRejected(reason))
            }
            EventRoute::Disconnected => {
                return Err(MqttError::ConnectionRejected("broker sent DISCONNECT".to_string()))
            }
            other => trace!("Event before CONNACK: {:?}", other),
        }
    }
}

/// Drive the event loop until the connection fails or `stop` is raised
async fn pump_events(
    mut event_loop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    acks: Arc<Mutex<AckTracker>>,
    mut stop: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.wait_for(|stop| *stop) => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::MessageReceived(message) => {
                    let forwarded = tokio::select! {
                        biased;
                        _ = stop.wait_for(|stop| *stop) => false,
                        sent = inbound.send(message) => sent.is_ok(),
                    };
                    if !forwarded {
                        break;
                    }
                }
                EventRoute::PublishWritten { packet_id } => acks.lock().await.written(packet_id),
                EventRoute::PublishDeferred { packet_id } => acks.lock().await.deferred(packet_id),
                EventRoute::PublishAcknowledged { packet_id } => {
                    acks.lock().await.acknowledged(packet_id)
                }
                EventRoute::Disconnected => {
                    warn!("Broker closed the MQTT session");
                    break;
                }
                EventRoute::SubscriptionConfirmed { packet_id } => {
                    debug!(packet_id, "Subscription acknowledged")
                }
                EventRoute::ConnectionAcknowledged { .. } => {
                    debug!("Unexpected CONNACK on established session")
                }
                EventRoute::InfrastructureEvent(event) => trace!("MQTT event: {}", event),
                EventRoute::OutgoingEvent => {}
            },
            Err(e) => {
                warn!("MQTT event loop error: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    let unacknowledged = acks.lock().await.abandon();
    if unacknowledged > 0 {
        warn!(unacknowledged, "Connection ended with publishes awaiting acknowledgement");
    }
    debug!("MQTT event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    fn wire(broker_url: &str) -> RumqttcWire {
        let mut config = BusConfig::for_broker("wire-test", broker_url).mqtt;
        config.connect_timeout_ms = 500;
        RumqttcWire::new("wire-test", config, 16)
    }

    #[tokio::test]
    async fn test_operations_fail_before_connect() {
        let wire = wire("mqtt://localhost:1883");

        assert!(!wire.is_connected());
        assert!(matches!(
            wire.subscribe("a/#", QoS::AtLeastOnce).await,
            Err(MqttError::NotConnected)
        ));
        assert!(matches!(
            wire.publish("a", Bytes::from_static(b"x"), QoS::AtLeastOnce).await,
            Err(MqttError::NotConnected)
        ));
        assert!(wire.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_unsupported_scheme() {
        let wire = wire("mqtt://localhost:1883");

        let result = wire.connect("ws://localhost:9001").await;

        assert!(matches!(result, Err(MqttError::UnsupportedScheme(_))));
        assert!(!wire.is_connected());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Port 1 is reserved and nothing listens there
        let wire = wire("mqtt://127.0.0.1:1");

        let result = wire.connect("mqtt://127.0.0.1:1").await;

        assert!(result.is_err());
        assert!(!wire.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_ok() {
        let wire = wire("mqtt://localhost:1883");

        assert!(wire.disconnect().await.is_ok());
        assert!(wire.disconnect().await.is_ok());
    }

    fn waiter(qos: QoS) -> (AckWaiter, oneshot::Receiver<()>) {
        let (done, rx) = oneshot::channel();
        (AckWaiter { qos, done }, rx)
    }

    #[test]
    fn test_ack_tracker_completes_only_on_acknowledgement() {
        let mut tracker = AckTracker::default();
        let (first, mut first_rx) = waiter(QoS::AtLeastOnce);
        let (second, mut second_rx) = waiter(QoS::AtLeastOnce);
        tracker.queued.push_back(first);
        tracker.queued.push_back(second);

        tracker.written(1);
        tracker.written(2);
        assert!(first_rx.try_recv().is_err());

        tracker.acknowledged(2);
        assert!(second_rx.try_recv().is_ok());
        assert!(first_rx.try_recv().is_err());

        tracker.acknowledged(1);
        assert!(first_rx.try_recv().is_ok());
        assert!(tracker.in_flight.is_empty());
    }

    #[test]
    fn test_ack_tracker_qos0_completes_when_written() {
        let mut tracker = AckTracker::default();
        let (qos0, mut rx) = waiter(QoS::AtMostOnce);
        tracker.queued.push_back(qos0);

        tracker.written(0);

        assert!(rx.try_recv().is_ok());
        assert!(tracker.in_flight.is_empty());
    }

    #[test]
    fn test_ack_tracker_resolves_packet_id_collision_in_order() {
        let mut tracker = AckTracker::default();
        let (original, mut original_rx) = waiter(QoS::AtLeastOnce);
        let (collided, mut collided_rx) = waiter(QoS::AtLeastOnce);
        tracker.queued.push_back(original);
        tracker.queued.push_back(collided);

        tracker.written(5);
        tracker.deferred(5);
        tracker.written(5);
        tracker.acknowledged(5);

        assert!(original_rx.try_recv().is_ok());
        assert!(collided_rx.try_recv().is_err());
        tracker.acknowledged(5);
        assert!(collided_rx.try_recv().is_ok());
    }

    #[test]
    fn test_ack_tracker_abandon_fails_every_waiter() {
        let mut tracker = AckTracker::default();
        let (queued, mut queued_rx) = waiter(QoS::AtLeastOnce);
        let (written, mut written_rx) = waiter(QoS::ExactlyOnce);
        tracker.queued.push_back(written);
        tracker.queued.push_back(queued);
        tracker.written(1);

        assert_eq!(tracker.abandon(), 2);

        assert!(matches!(
            written_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(matches!(
            queued_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
