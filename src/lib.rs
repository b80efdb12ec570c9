//! cloudbridge - store-and-forward device bridge
//!
//! A device-resident agent that queues events from local producers in a
//! durable store, delivers them to an MQTT broker with at-least-once
//! semantics once the link is up, and relays broker commands back to local
//! listeners.
//!
//! # Overview
//!
//! - [`store`]: durable, timestamp-ordered event queue (SQLite)
//! - [`transport`]: broker session abstraction and its MQTT implementation
//! - [`delivery`]: single-worker drain loop with retry backoff
//! - [`downlink`]: listener registry and command fan-out
//! - [`bridge`]: the controller that wires them together
//!
//! # Quick Start
//!
//! ```rust
//! use cloudbridge::bridge::BridgeController;
//! use cloudbridge::config::DeliverySection;
//! use cloudbridge::identity::DeviceIdentity;
//! use cloudbridge::protocol::Event;
//! use cloudbridge::store::SqliteEventStore;
//! use cloudbridge::testing::MockBroker;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = DeviceIdentity::new("pump-fleet", "unit-42")?;
//! let store = Arc::new(SqliteEventStore::open_in_memory()?);
//! let bridge = BridgeController::new(
//!     store,
//!     Arc::new(MockBroker::new()),
//!     identity,
//!     DeliverySection::default(),
//! );
//!
//! // Returns as soon as the event is durably queued
//! bridge.publish(Event::new("urn:local:scale", "weight", r#"{"grams":412}"#))?;
//! assert_eq!(bridge.status().backlog, Some(1));
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod downlink;
pub mod error;
pub mod identity;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeController, BridgePhase, BridgeStatus};
pub use config::*;
pub use downlink::{EventListener, ListenerError, ListenerHandle};
pub use error::{BridgeError, BridgeResult};
pub use identity::DeviceIdentity;
pub use protocol::*;
pub use store::{EventStore, SqliteEventStore};
pub use transport::mqtt::MqttClient;
