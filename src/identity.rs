//! Device identity used as MQTT client id and topic prefix
//!
//! The identity is `{fleet}/{device_id}`. A configured device id wins;
//! otherwise a generated id is read from (or written to) the identity file so
//! that a restarted agent reconnects under the same client id.

use crate::config::{ConfigError, DeviceSection};
use crate::protocol::validate_identity_segment;
use std::fmt;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    fleet: String,
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(fleet: &str, device_id: &str) -> Result<Self, ConfigError> {
        validate_identity_segment("fleet", fleet)
            .map_err(|e| ConfigError::Identity(e.to_string()))?;
        validate_identity_segment("device_id", device_id)
            .map_err(|e| ConfigError::Identity(e.to_string()))?;
        Ok(Self {
            fleet: fleet.to_string(),
            device_id: device_id.to_string(),
        })
    }

    /// Resolve the identity from configuration, persisting a generated id
    /// when an identity file is configured
    pub fn resolve(section: &DeviceSection) -> Result<Self, ConfigError> {
        if let Some(id) = &section.id {
            return Self::new(&section.fleet, id);
        }

        match &section.identity_file {
            Some(path) => Self::load_or_create(&section.fleet, path),
            None => {
                let generated = Uuid::new_v4().to_string();
                info!(
                    device_id = %generated,
                    "No identity file configured, using a per-process device id"
                );
                Self::new(&section.fleet, &generated)
            }
        }
    }

    fn load_or_create(fleet: &str, path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let stored = std::fs::read_to_string(path)?;
            let device_id = stored.trim();
            info!(path = %path.display(), device_id = %device_id, "Loaded persisted device id");
            return Self::new(fleet, device_id);
        }

        let device_id = Uuid::new_v4().to_string();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, format!("{device_id}\n"))?;
        info!(path = %path.display(), device_id = %device_id, "Persisted new device id");
        Self::new(fleet, &device_id)
    }

    pub fn fleet(&self) -> &str {
        &self.fleet
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Full identity string, used verbatim as the MQTT client id
    pub fn as_client_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fleet, self.device_id)
    }
}
