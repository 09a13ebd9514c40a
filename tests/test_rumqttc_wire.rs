//! RumqttcWire against an in-process fake broker
//!
//! The broker speaks just enough MQTT 5, using rumqttc's own packet codec,
//! to script acknowledgements, dropped sockets and inbound floods. These run
//! without an external broker.


use bytes::BytesMut;
use mqtt_integration_helpers::mqtt_config;
use mqttbus::store::{EventStatus, MemoryStore};
use mqttbus::testing::RecordingCallback;
use mqttbus::transport::mqtt::{MqttError, RumqttcWire};
use mqttbus::transport::{QoS, WireClient};
use mqttbus::{BusOptions, MessageBus};
use rumqttc::v5::mqttbytes::v5::{
    ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, Publish, SubAck, SubscribeReasonCode,
};
use rumqttc::v5::mqttbytes::Error as CodecError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Longer than the shared helper bound; the flood test moves a few hundred
/// packets through a real socket
const SLOW_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum Script {
    /// PUBACK every publish
    Ack,
    /// Accept publishes but never acknowledge them
    Silent,
    /// Close the first connection on its first PUBLISH, PUBACK afterwards
    DropFirstPublish,
    /// PUBACK every publish and answer SUBSCRIBE with `count` QoS 0
    /// messages on `topic`
    FloodOnSubscribe { topic: String, count: usize },
}

#[derive(Default)]
struct BrokerStats {
    connections: AtomicUsize,
    /// PUBLISH packets received, one entry per connection
    publishes: Mutex<Vec<usize>>,
}

struct FakeBroker {
    url: String,
    stats: Arc<BrokerStats>,
}

impl FakeBroker {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("mqtt://{}", listener.local_addr().unwrap());
        let stats = Arc::new(BrokerStats::default());

        let accept_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = accept_stats.connections.fetch_add(1, Ordering::SeqCst);
                accept_stats.publishes.lock().await.push(0);
                tokio::spawn(serve(socket, index, script.clone(), accept_stats.clone()));
            }
        });

        Self { url, stats }
    }

    fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    async fn publishes_per_connection(&self) -> Vec<usize> {
        self.stats.publishes.lock().await.clone()
    }
}

async fn serve(mut socket: TcpStream, index: usize, script: Script, stats: Arc<BrokerStats>) {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let packet = match Packet::read(&mut buffer, None) {
            Ok(packet) => packet,
            Err(CodecError::InsufficientBytes(_)) => match socket.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };

        let mut out = BytesMut::new();
        match packet {
            Packet::Connect(..) => {
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: ConnectReturnCode::Success,
                    properties: None,
                })
                .write(&mut out)
                .unwrap();
            }
            Packet::Subscribe(subscribe) => {
                Packet::SubAck(SubAck {
                    pkid: subscribe.pkid,
                    return_codes: vec![
                        SubscribeReasonCode::Success(QoS::AtLeastOnce);
                        subscribe.filters.len()
                    ],
                    properties: None,
                })
                .write(&mut out)
                .unwrap();
                if let Script::FloodOnSubscribe { topic, count } = &script {
                    for n in 0..*count {
                        Packet::Publish(Publish::new(
                            topic.as_str(),
                            QoS::AtMostOnce,
                            n.to_string(),
                            None,
                        ))
                        .write(&mut out)
                        .unwrap();
                    }
                }
            }
            Packet::Publish(publish) => {
                stats.publishes.lock().await[index] += 1;
                match script {
                    Script::Silent => {}
                    Script::DropFirstPublish if index == 0 => return,
                    _ => {
                        if publish.qos == QoS::AtLeastOnce {
                            Packet::PubAck(PubAck::new(publish.pkid, None))
                                .write(&mut out)
                                .unwrap();
                        }
                    }
                }
            }
            Packet::PingReq(_) => {
                Packet::PingResp(PingResp).write(&mut out).unwrap();
            }
            Packet::Disconnect(_) => return,
            _ => {}
        }

        if !out.is_empty() && socket.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn wire_for(client_id: &str, ack_timeout: Duration) -> RumqttcWire {
    let mut config = mqtt_config();
    config.connect_timeout_ms = 1_000;
    config.ack_timeout_ms = ack_timeout.as_millis() as u64;
    RumqttcWire::new(client_id, config, 16)
}

fn bus_for(broker: &FakeBroker, client_id: &str) -> MessageBus<RumqttcWire> {
    let wire = Arc::new(wire_for(client_id, Duration::from_secs(2)));
    let options = BusOptions::new(broker.url.clone())
        .with_reconnect_backoff(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_millis(200));
    MessageBus::new(wire, Arc::new(MemoryStore::new()), options)
}

async fn eventually_within<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_publish_returns_after_puback() {
    // Arrange
    let broker = FakeBroker::start(Script::Ack).await;
    let wire = wire_for("wire-ack", Duration::from_secs(2));
    wire.connect(&broker.url).await.unwrap();

    // Act
    let result = wire
        .publish("orders/1", "created".into(), QoS::AtLeastOnce)
        .await;

    // Assert
    assert!(result.is_ok(), "acknowledged publish should succeed: {result:?}");
    assert_eq!(broker.publishes_per_connection().await, vec![1]);

    wire.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_without_puback_times_out() {
    // Arrange
    let broker = FakeBroker::start(Script::Silent).await;
    let wire = wire_for("wire-silent", Duration::from_millis(300));
    wire.connect(&broker.url).await.unwrap();

    // Act
    let result = wire
        .publish("orders/1", "created".into(), QoS::AtLeastOnce)
        .await;

    // Assert: written to the broker, but never confirmed
    assert!(matches!(result, Err(MqttError::AckTimeout(_))), "{result:?}");
    assert_eq!(broker.publishes_per_connection().await, vec![1]);

    wire.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_fails_when_connection_drops_before_puback() {
    // Arrange
    let broker = FakeBroker::start(Script::DropFirstPublish).await;
    let wire = wire_for("wire-drop", Duration::from_secs(5));
    wire.connect(&broker.url).await.unwrap();

    // Act
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        wire.publish("orders/1", "created".into(), QoS::AtLeastOnce),
    )
    .await
    .expect("publish must not outlive the connection");

    // Assert
    assert!(matches!(result, Err(MqttError::NotAcknowledged)), "{result:?}");
    assert!(wire.next_message().await.is_none());
}

#[tokio::test]
async fn test_unacknowledged_event_is_replayed_after_reconnect() {
    // Arrange
    let broker = FakeBroker::start(Script::DropFirstPublish).await;
    let bus = bus_for(&broker, "bus-drop");
    bus.start().await.unwrap();
    assert!(bus.wait_until_connected(SLOW_WAIT).await);

    // Act: the broker closes the socket instead of acknowledging
    let id = bus.publish("orders/1", "created").await.unwrap();

    // Assert: confirmed only once the second connection acknowledged it
    let outbox = bus.outbox().clone();
    assert!(
        eventually_within(SLOW_WAIT, || {
            let outbox = outbox.clone();
            async move {
                outbox
                    .get(id)
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|record| record.status == EventStatus::Sent)
            }
        })
        .await
    );
    assert!(broker.connections() >= 2);
    let publishes = broker.publishes_per_connection().await;
    assert_eq!(publishes[0], 1);
    assert_eq!(publishes[1], 1);
    assert_eq!(bus.outbox().len().await.unwrap(), 1);

    bus.stop().await;
}

#[tokio::test]
async fn test_inbound_flood_during_replay_does_not_stall() {
    // Arrange: more offline events and inbound messages than either queue holds
    let broker = FakeBroker::start(Script::FloodOnSubscribe {
        topic: "a/b".to_string(),
        count: 300,
    })
    .await;
    let bus = bus_for(&broker, "bus-flood");
    let callback = RecordingCallback::new();
    bus.subscribe("a/#", callback.handle()).await.unwrap();
    for n in 0..150 {
        bus.publish(&format!("out/{n}"), "queued").await.unwrap();
    }
    assert_eq!(bus.outbox().backlog().await.unwrap(), 150);

    // Act
    bus.start().await.unwrap();

    // Assert
    let outbox = bus.outbox().clone();
    assert!(
        eventually_within(SLOW_WAIT, || {
            let outbox = outbox.clone();
            async move { outbox.backlog().await.ok() == Some(0) }
        })
        .await,
        "replay stalled behind inbound traffic"
    );
    assert!(callback.wait_for(300, SLOW_WAIT).await);
    assert_eq!(bus.outbox().len().await.unwrap(), 150);

    bus.stop().await;
}
