//! Event model carried by the bridge in both directions
//!
//! An [`Event`] is the unit of uplink traffic queued by local producers and the
//! unit of downlink traffic handed to local listeners. The payload is opaque:
//! nothing in the bridge parses it.

use super::topics::{validate_event_type, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source identifier stamped on every command received from the broker
pub const CONTROL_CENTER_SOURCE: &str = "urn:cloud:control-center";

/// Priority assigned to downlink commands
pub const COMMAND_PRIORITY: i32 = 2;

/// Content type assumed for broker payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A single event flowing through the bridge
///
/// Field names on the wire follow the local IPC contract (`type`, `time`,
/// `contentType`), so producers written against that contract can hand their
/// JSON straight to [`serde_json::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique identifier, also the queue key
    pub id: String,
    /// Origin identifier of the producer
    pub source: String,
    /// Event type; doubles as the routing key of the outbound topic
    #[serde(rename = "type")]
    pub event_type: String,
    /// Epoch milliseconds
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// 0 = low .. 2 = high; other values fall back to best-effort delivery
    pub priority: i32,
    pub content_type: String,
    pub payload: String,
}

impl Event {
    /// Create an event with a fresh id, the current time, priority 0 and a
    /// JSON content type
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            priority: 0,
            content_type: JSON_CONTENT_TYPE.to_string(),
            payload: payload.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Build the event handed to local listeners for an inbound broker message.
    ///
    /// The full inbound topic becomes the event type. Payload bytes that are
    /// not valid UTF-8 are converted lossily.
    pub fn command(topic: &str, payload: &[u8]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: CONTROL_CENTER_SOURCE.to_string(),
            event_type: topic.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            priority: COMMAND_PRIORITY,
            content_type: JSON_CONTENT_TYPE.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }

    /// Delivery guarantee requested for this event
    pub fn quality_level(&self) -> QualityLevel {
        QualityLevel::from_priority(self.priority)
    }

    /// Reject events that cannot be queued or routed
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyField("id"));
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::EmptyField("source"));
        }
        validate_event_type(&self.event_type)
    }
}

/// Transport delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    /// Fire-and-forget (MQTT QoS 0)
    BestEffort,
    /// Acknowledged by the broker (MQTT QoS 1)
    AtLeastOnce,
}

impl QualityLevel {
    /// Map an event priority to a quality level.
    ///
    /// Unmapped priorities are not an error; they degrade to best-effort.
    pub fn from_priority(priority: i32) -> Self {
        match priority {
            0 => QualityLevel::BestEffort,
            1 | 2 => QualityLevel::AtLeastOnce,
            _ => QualityLevel::BestEffort,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::BestEffort => "best_effort",
            QualityLevel::AtLeastOnce => "at_least_once",
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
