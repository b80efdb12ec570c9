//! Pure connection state management for the MQTT session
//!
//! This module contains pure functions for connection state management,
//! configuration handling, and topic construction.

use crate::config::MqttSection;
use crate::identity::DeviceIdentity;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not started, or stopped by `disconnect()`
    Disconnected,
    /// Initial connection attempt in progress
    Connecting,
    /// ConnAck received; publishing and subscribing allowed
    Connected,
    /// Link failed; the reason is the client error
    ConnectionLost(String),
    /// Waiting out the backoff before reconnection attempt N
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ConnectionLost(_) => "connection_lost",
            ConnectionState::Reconnecting(_) => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::ConnectionLost(reason) => write!(f, "connection_lost ({reason})"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Reconnection policy of the MQTT client
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![4_000, 8_000, 16_000, 32_000, 64_000],
            sustained_delay: 128_000,
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(config: &MqttSection) -> Self {
        Self {
            backoff_pattern: config.reconnect_backoff_ms.clone(),
            sustained_delay: config.reconnect_sustained_ms,
        }
    }

    /// Calculate backoff delay for given attempt (1-based) using the pattern
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Broker rejected publish: {0}")]
    PublishRejected(String),
    #[error("Publish abandoned before acknowledgment: {0}")]
    PublishAbandoned(String),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Pure function to configure MQTT options from config
///
/// The client id is the device identity, fixed for the lifetime of the
/// identity so that the broker sees the same client across reconnects.
pub fn configure_mqtt_options(
    identity: &DeviceIdentity,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let secure = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(identity.as_client_id(), host, port);

    if secure {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

/// Topic construction for the broker wire contract
pub struct TopicBuilder;

impl TopicBuilder {
    /// Uplink topic: `{identity}/{event_type}`
    pub fn build_uplink_topic(identity: &DeviceIdentity, event_type: &str) -> String {
        format!("{identity}/{event_type}")
    }

    /// Downlink subscription filter: `{identity}/cmd/#`
    pub fn build_downlink_filter(identity: &DeviceIdentity) -> String {
        format!("{identity}/cmd/#")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> DeviceIdentity {
        DeviceIdentity::new("pump-fleet", "unit-42").unwrap()
    }

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            reconnect_backoff_ms: vec![25, 50, 100],
            reconnect_sustained_ms: 250,
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_pattern, vec![4_000, 8_000, 16_000, 32_000, 64_000]);
        assert_eq!(config.sustained_delay, 128_000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::from_section(&test_mqtt_config());

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(3), 100);

        // Sustained delay after pattern exhausted
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            backoff_pattern: vec![],
            sustained_delay: 300,
        };
        assert_eq!(config.calculate_backoff_delay(1), 300);
    }

    #[test]
    fn test_topic_construction() {
        let identity = test_identity();
        assert_eq!(
            TopicBuilder::build_uplink_topic(&identity, "weight"),
            "pump-fleet/unit-42/weight"
        );
        assert_eq!(
            TopicBuilder::build_uplink_topic(&identity, "alarms/occlusion"),
            "pump-fleet/unit-42/alarms/occlusion"
        );
        assert_eq!(
            TopicBuilder::build_downlink_filter(&identity),
            "pump-fleet/unit-42/cmd/#"
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(&test_identity(), &test_mqtt_config()).unwrap();
        assert_eq!(options.client_id(), "pump-fleet/unit-42");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_secure_scheme_default_port() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtts://broker.example.com".to_string();

        let options = configure_mqtt_options(&test_identity(), &config).unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 8883)
        );
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();

        let result = configure_mqtt_options(&test_identity(), &config);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(
            ConnectionState::ConnectionLost("io".to_string()).as_str(),
            "connection_lost"
        );
        assert_eq!(ConnectionState::Reconnecting(3).as_str(), "reconnecting");
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected,
            },
            MqttError::PublishRejected("NotAuthorized".to_string()),
            MqttError::PublishAbandoned("connection lost".to_string()),
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
