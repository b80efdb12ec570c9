//! Error types of the bridge
//!
//! Producers only ever see [`BridgeError::InvalidEvent`],
//! [`BridgeError::DuplicateId`] and [`BridgeError::StorageFault`]; the other
//! kinds are reported through logs and metrics by the component that hit them.

use crate::config::ConfigError;
use crate::protocol::ValidationError;
use crate::store::StoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] ValidationError),

    #[error("Duplicate event id: {0}")]
    DuplicateId(String),

    #[error("Storage fault: {0}")]
    StorageFault(#[source] StoreError),

    #[error("Connection fault: {message}")]
    ConnectionFault { message: String },

    #[error("Publish fault for event {event_id}: {message}")]
    PublishFault { event_id: String, message: String },

    #[error("Listener fault: {message}")]
    ListenerFault { message: String },

    #[error("Subscription fault: {message}")]
    SubscriptionFault { message: String },

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Invalid bridge state: {0}")]
    InvalidState(String),
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateId(id) => BridgeError::DuplicateId(id),
            other => BridgeError::StorageFault(other),
        }
    }
}

impl BridgeError {
    /// Create connection fault
    pub fn connection_fault<E: std::fmt::Display>(err: E) -> Self {
        Self::ConnectionFault {
            message: redact_secrets(&err.to_string()),
        }
    }

    /// Create publish fault for one event
    pub fn publish_fault<E: std::fmt::Display>(event_id: &str, err: E) -> Self {
        Self::PublishFault {
            event_id: event_id.to_string(),
            message: redact_secrets(&err.to_string()),
        }
    }

    /// Create listener fault
    pub fn listener_fault<S: Into<String>>(message: S) -> Self {
        Self::ListenerFault {
            message: message.into(),
        }
    }

    /// Create subscription fault
    pub fn subscription_fault<S: Into<String>>(message: S) -> Self {
        Self::SubscriptionFault {
            message: message.into(),
        }
    }

    /// True for errors a producer can fix by changing the event
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidEvent(_) | BridgeError::DuplicateId(_)
        )
    }
}

static URL_CREDENTIALS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/\s:@]+:[^/\s@]+@").ok());

static SECRET_ASSIGNMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|secret)[=:]\s*\S+").ok());

const MAX_MESSAGE_LEN: usize = 500;

/// Strip credentials from text that ends up in logs or status reports
///
/// Broker URLs may carry `user:password@`, and client errors sometimes echo
/// them back.
pub fn redact_secrets(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = URL_CREDENTIALS.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}***@").to_string();
    }
    if let Some(re) = SECRET_ASSIGNMENT.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
