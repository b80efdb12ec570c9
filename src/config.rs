//! Configuration system for the bridge agent
//!
//! Configuration is a single TOML file. Broker credentials never live in the
//! file; it only names the environment variables that hold them.

use crate::protocol::validate_identity_segment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    pub store: StoreSection,
    #[serde(default)]
    pub delivery: DeliverySection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Identity prefix shared by every device of the fleet
    pub fleet: String,
    /// Fixed device id; when absent an id is generated (and persisted if
    /// `identity_file` is set)
    pub id: Option<String>,
    /// File used to persist a generated device id across restarts
    pub identity_file: Option<PathBuf>,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Reconnection delays in milliseconds, one per attempt
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: Vec<u64>,
    /// Delay used once `reconnect_backoff_ms` is exhausted
    #[serde(default = "default_reconnect_sustained")]
    pub reconnect_sustained_ms: u64,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_reconnect_backoff() -> Vec<u64> {
    vec![4_000, 8_000, 16_000, 32_000, 64_000]
}

fn default_reconnect_sustained() -> u64 {
    128_000
}

/// Durable queue section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// SQLite database file holding the backlog
    pub path: PathBuf,
}

/// Delivery pipeline timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverySection {
    /// Wait before re-checking an empty backlog
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
    /// Wait after a failed publish before the next drain cycle
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Upper bound on waiting for a publish acknowledgment
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    /// Interval of the status log line (0 disables it)
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

fn default_idle_interval() -> u64 {
    1_000
}

fn default_retry_backoff() -> u64 {
    5_000
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_status_interval() -> u64 {
    300
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval(),
            retry_backoff_ms: default_retry_backoff(),
            ack_timeout_secs: default_ack_timeout(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl DeliverySection {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Device identity error: {0}")]
    Identity(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identity_segment("device.fleet", &self.device.fleet)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        if let Some(id) = &self.device.id {
            validate_identity_segment("device.id", id)
                .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        }

        let url = Url::parse(&self.mqtt.broker_url).map_err(|_| {
            ConfigError::InvalidConfig(format!("Invalid broker URL: {}", self.mqtt.broker_url))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
            return Err(ConfigError::InvalidConfig(format!(
                "Unsupported broker URL scheme '{}'",
                url.scheme()
            )));
        }

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.reconnect_sustained_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect_sustained_ms must be greater than 0".to_string(),
            ));
        }
        if self.delivery.ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "delivery.ack_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.delivery.idle_interval_ms == 0 || self.delivery.retry_backoff_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "delivery intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
[device]
fleet = "pump-fleet"
id = "unit-42"

[mqtt]
broker_url = "mqtts://broker.example.com:8883"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
reconnect_backoff_ms = [100, 200]
reconnect_sustained_ms = 500

[store]
path = "/var/lib/cloudbridge/events.db"

[delivery]
idle_interval_ms = 250
retry_backoff_ms = 2000
ack_timeout_secs = 10
status_interval_secs = 0
"#;

    const MINIMAL_CONFIG: &str = r#"
[device]
fleet = "pump-fleet"

[mqtt]
broker_url = "mqtt://localhost:1883"

[store]
path = "events.db"
"#;

    #[test]
    fn test_full_config() {
        let config = BridgeConfig::from_toml_str(FULL_CONFIG).unwrap();
        assert_eq!(config.device.fleet, "pump-fleet");
        assert_eq!(config.device.id.as_deref(), Some("unit-42"));
        assert_eq!(config.mqtt.broker_url, "mqtts://broker.example.com:8883");
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.reconnect_backoff_ms, vec![100, 200]);
        assert_eq!(config.mqtt.reconnect_sustained_ms, 500);
        assert_eq!(
            config.store.path,
            PathBuf::from("/var/lib/cloudbridge/events.db")
        );
        assert_eq!(config.delivery.idle_interval(), Duration::from_millis(250));
        assert_eq!(config.delivery.retry_backoff(), Duration::from_secs(2));
        assert_eq!(config.delivery.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.delivery.status_interval_secs, 0);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::from_toml_str(MINIMAL_CONFIG).unwrap();
        assert_eq!(config.device.id, None);
        assert_eq!(config.device.identity_file, None);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(
            config.mqtt.reconnect_backoff_ms,
            vec![4_000, 8_000, 16_000, 32_000, 64_000]
        );
        assert_eq!(config.mqtt.reconnect_sustained_ms, 128_000);
        assert_eq!(config.delivery, DeliverySection::default());
        assert_eq!(config.delivery.idle_interval(), Duration::from_secs(1));
        assert_eq!(config.delivery.retry_backoff(), Duration::from_secs(5));
        assert_eq!(config.delivery.ack_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_fleet_rejected() {
        let content = MINIMAL_CONFIG.replace("pump-fleet", "pump/fleet");
        let result = BridgeConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let content = MINIMAL_CONFIG.replace("mqtt://localhost:1883", "not a url");
        let result = BridgeConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let content = MINIMAL_CONFIG.replace("mqtt://localhost:1883", "http://localhost");
        let result = BridgeConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_ack_timeout_rejected() {
        let content = format!("{MINIMAL_CONFIG}\n[delivery]\nack_timeout_secs = 0\n");
        let result = BridgeConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_section_is_parse_error() {
        let result = BridgeConfig::from_toml_str("[device]\nfleet = \"f\"\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudbridge.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let config = BridgeConfig::load_from_file(&path).unwrap();
        assert_eq!(config.device.id.as_deref(), Some("unit-42"));

        let missing = BridgeConfig::load_from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_credentials_from_environment() {
        let content = MINIMAL_CONFIG.replace(
            "broker_url = \"mqtt://localhost:1883\"",
            "broker_url = \"mqtt://localhost:1883\"\nusername_env = \"CLOUDBRIDGE_TEST_USER\"",
        );
        let config = BridgeConfig::from_toml_str(&content).unwrap();

        std::env::set_var("CLOUDBRIDGE_TEST_USER", "device-user");
        assert_eq!(config.get_mqtt_username().as_deref(), Some("device-user"));
        assert_eq!(config.get_mqtt_password(), None);
        std::env::remove_var("CLOUDBRIDGE_TEST_USER");
    }
}
