//! Pure message routing and processing logic for MQTT events
//!
//! This module contains pure functions for handling MQTT events and routing
//! decisions, plus the forwarder that hands inbound messages to the bridge.

use crate::observability::metrics;
use crate::protocol::QualityLevel;
use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason};
use rumqttc::v5::{mqttbytes::QoS, Event};
use rumqttc::Outgoing;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                    accepted: Self::is_puback_success(&puback.reason),
                    reason: format!("{:?}", puback.reason),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(|code| format!("{code:?}"))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// PubAck reasons that mean the broker took the message
    pub fn is_puback_success(reason: &PubAckReason) -> bool {
        matches!(
            reason,
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers
        )
    }

    /// Map a delivery guarantee onto an MQTT QoS (pure function)
    pub fn determine_qos_level(quality: QualityLevel) -> QoS {
        match quality {
            QualityLevel::BestEffort => QoS::AtMostOnce,
            QualityLevel::AtLeastOnce => QoS::AtLeastOnce,
        }
    }

    /// Determine if an inbound message should be relayed (pure function)
    pub fn should_process_message(topic: &str, downlink_prefix: &str) -> bool {
        if !topic.starts_with(downlink_prefix) {
            debug!(
                "Topic outside downlink namespace: expected prefix {}, got {}",
                downlink_prefix, topic
            );
            return false;
        }

        true
    }

    /// Validate subscription success from SubAck reason codes (pure function)
    ///
    /// Granted codes render as `Success(..)` or `QoSn`; anything else is a
    /// refusal from the broker.
    pub fn validate_subscription_success(return_codes: &[String]) -> Result<(), String> {
        let rejected: Vec<&String> = return_codes
            .iter()
            .filter(|code| !(code.starts_with("Success") || code.starts_with("QoS")))
            .collect();

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "Subscription failed with return codes: {rejected:?}"
            ))
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Publish packet written to the network (packet id 0 for QoS 0)
    PublishSent { packet_id: u16 },
    /// PubAck received for a QoS 1 publish
    PublishAcknowledged {
        packet_id: u16,
        accepted: bool,
        reason: String,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<String>,
    },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Hands inbound broker messages to the bridge
#[derive(Debug, Clone, Default)]
pub struct MessageForwarder {
    inbound_sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_inbound_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.inbound_sender = Some(sender);
    }

    /// Forward an inbound message without waiting for queue space
    ///
    /// Runs on the event loop task, so a full queue drops the message rather
    /// than stalling acknowledgments and keep-alives.
    pub fn forward(&self, message: InboundMessage) -> Result<(), String> {
        match self.inbound_sender {
            Some(ref sender) => match sender.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(message)) => {
                    metrics().command_dropped();
                    warn!(
                        topic = %message.topic,
                        "Downlink queue full, command dropped"
                    );
                    Err("Downlink queue full".to_string())
                }
                Err(TrySendError::Closed(_)) => {
                    Err("Inbound receiver closed".to_string())
                }
            },
            None => {
                warn!(
                    topic = %message.topic,
                    "Received MQTT message but no inbound receiver configured - message dropped"
                );
                Err("No inbound receiver configured".to_string())
            }
        }
    }
}
