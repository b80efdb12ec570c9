//! MQTT v5 broker session for the bridge
//!
//! This module provides a decomposed MQTT client implementation that
//! separates pure functions from I/O operations for testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state management, options and topics
//! - [`message_handler`] - Pure routing of event loop events
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`acks`] - Correlation of publish requests with broker acknowledgments
//! - [`client`] - Impure I/O operations and the reconnection supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use cloudbridge::config::MqttSection;
//! use cloudbridge::identity::DeviceIdentity;
//! use cloudbridge::protocol::QualityLevel;
//! use cloudbridge::transport::{mqtt::MqttClient, BrokerSession};
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::new("pump-fleet", "unit-42")?;
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//!     reconnect_backoff_ms: vec![4_000, 8_000],
//!     reconnect_sustained_ms: 16_000,
//! };
//!
//! let client = MqttClient::new(identity, config)?;
//! client.connect().await?;
//! client
//!     .publish("pump-fleet/unit-42/weight", b"{}".to_vec(), QualityLevel::AtLeastOnce)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod acks;
pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use acks::{AckTracker, PublishOutcome};
pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig, TopicBuilder};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
