//! Pure routing of rumqttc events

use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use tracing::debug;

use crate::transport::InboundMessage;

/// What the event pump should do with one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK; `accepted` is false when the broker refused the session
    ConnectionAcknowledged { accepted: bool, reason: String },
    /// Application message on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker sent DISCONNECT
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) for one of our publishes
    PublishAcknowledged { packet_id: u16 },
    /// One of our publishes was written; packet id 0 means QoS 0
    PublishWritten { packet_id: u16 },
    /// rumqttc is holding a publish until `packet_id` is acknowledged
    PublishDeferred { packet_id: u16 },
    /// PINGRESP, PUBREC and the like
    InfrastructureEvent(String),
    /// Other outgoing packets, handled by rumqttc
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    accepted: matches!(connack.code, ConnectReturnCode::Success),
                    reason: format!("{:?}", connack.code),
                },
                Packet::Publish(publish) => {
                    if publish.retain {
                        debug!(
                            topic = %String::from_utf8_lossy(&publish.topic),
                            "Delivering retained message"
                        );
                    }
                    EventRoute::MessageReceived(InboundMessage::new(
                        String::from_utf8_lossy(&publish.topic).to_string(),
                        publish.payload.clone(),
                    ))
                }
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged {
                    packet_id: pubcomp.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishWritten {
                packet_id: *packet_id,
            },
            Event::Outgoing(Outgoing::AwaitAck(packet_id)) => EventRoute::PublishDeferred {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}
