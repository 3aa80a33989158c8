//! Configuration surface consumed by the communication manager
//!
//! Loaded from a TOML file with environment-variable indirection for broker
//! credentials. The core consumes these settings; it does not own
//! configuration loading policy beyond this module.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::object::CoatyObject;

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub communication: CommunicationConfig,
}

/// Communication manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommunicationConfig {
    /// MQTT broker endpoint, e.g. `mqtt://localhost:1883`
    pub broker_url: String,
    /// Friendly name of the manager's identity Component
    #[serde(default = "default_identity_name")]
    pub identity_name: String,
    /// Start the manager as soon as the container resolves it
    #[serde(default)]
    pub should_auto_start: bool,
    /// Advertise the manager's own Component on Online
    #[serde(default = "default_true")]
    pub should_advertise_identity: bool,
    /// Advertise the associated Device on Online
    #[serde(default)]
    pub should_advertise_device: bool,
    /// Prefix identifiers on outgoing topics with their sanitized names
    #[serde(default)]
    pub use_readable_topics: bool,
    /// Bound on the deferred publish queue; None keeps it unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deferred_publishes: Option<usize>,
    /// Environment variable holding the broker username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable holding the broker password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// User included in outgoing topics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_user: Option<CoatyObject>,
    /// Device advertised alongside the identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_device: Option<CoatyObject>,
}

fn default_identity_name() -> String {
    "CommunicationManager".to_string()
}

fn default_true() -> bool {
    true
}

impl CommunicationConfig {
    /// Minimal configuration for the given broker endpoint
    pub fn new<S: Into<String>>(broker_url: S) -> Self {
        Self {
            broker_url: broker_url.into(),
            identity_name: default_identity_name(),
            should_auto_start: false,
            should_advertise_identity: true,
            should_advertise_device: false,
            use_readable_topics: false,
            max_deferred_publishes: None,
            username_env: None,
            password_env: None,
            associated_user: None,
            associated_device: None,
        }
    }

    /// Broker username resolved from the configured environment variable
    pub fn broker_username(&self) -> Option<String> {
        resolve_env(self.username_env.as_deref())
    }

    /// Broker password resolved from the configured environment variable
    pub fn broker_password(&self) -> Option<String> {
        resolve_env(self.password_env.as_deref())
    }
}

fn resolve_env(name: Option<&str>) -> Option<String> {
    name.and_then(|n| std::env::var(n).ok())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Configuration = toml::from_str(&content)?;
        if config.communication.broker_url.is_empty() {
            return Err(ConfigError::Invalid("broker_url must not be empty".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let toml_content = r#"
[communication]
broker_url = "mqtt://localhost:1883"
"#;
        let config: Configuration = toml::from_str(toml_content).unwrap();
        let comm = config.communication;
        assert_eq!(comm.broker_url, "mqtt://localhost:1883");
        assert_eq!(comm.identity_name, "CommunicationManager");
        assert!(comm.should_advertise_identity);
        assert!(!comm.should_advertise_device);
        assert!(!comm.should_auto_start);
        assert!(!comm.use_readable_topics);
        assert!(comm.associated_user.is_none());
        assert!(comm.max_deferred_publishes.is_none());
    }

    #[test]
    fn test_full_toml_round_trip() {
        let toml_content = r#"
[communication]
broker_url = "mqtts://broker.example:8883"
identity_name = "Light Agent"
should_auto_start = true
use_readable_topics = true
max_deferred_publishes = 64
username_env = "BROKER_USER"
password_env = "BROKER_PASS"

[communication.associated_user]
objectId = "0ea293e5-f8be-4a5d-886b-0e231e8234b2"
coreType = "User"
objectType = "coaty.User"
name = "HHO"
"#;
        let config: Configuration = toml::from_str(toml_content).unwrap();
        let comm = &config.communication;
        assert_eq!(comm.identity_name, "Light Agent");
        assert!(comm.use_readable_topics);
        assert_eq!(comm.max_deferred_publishes, Some(64));
        assert_eq!(comm.associated_user.as_ref().unwrap().name, "HHO");

        let serialized = toml::to_string(&config).unwrap();
        let reparsed: Configuration = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_load_from_file_rejects_empty_broker_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[communication]\nbroker_url = \"\"\n").unwrap();
        assert!(matches!(
            Configuration::load_from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
