//! Transport layer between the bridge and the cloud broker
//!
//! This module provides the broker session abstraction and its MQTT
//! implementation.

use crate::protocol::QualityLevel;
use tokio::sync::{mpsc, watch};

pub mod mqtt;

pub use mqtt::ConnectionState;

/// A message received on the downlink subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker session abstraction
///
/// This trait provides an abstraction over the broker connection to enable
/// dependency injection and testing. One session is shared by the delivery
/// pipeline and the bridge controller, so every method takes `&self`.
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the session; returns once the supervisor is running, not once
    /// the broker has answered
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Stop the session and release the broker connection
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Publish a payload and wait until the broker outcome for the requested
    /// quality level is known
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        quality: QualityLevel,
    ) -> Result<(), Self::Error>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Watch connection state transitions
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Route downlink messages to `sender`
    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>);

    /// Check if the session can currently publish
    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }
}

/// Type alias for the MQTT broker session
pub type MqttSession = mqtt::MqttClient;
