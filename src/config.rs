//! Bus configuration
//!
//! Loaded from a TOML file. Secrets never live in the file: the `[mqtt]`
//! section names environment variables that are read at connect time.
//!
//! ```toml
//! [client]
//! id = "edge-gateway-01"
//!
//! [mqtt]
//! broker_url = "mqtts://broker.example.com"
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//!
//! [reconnect]
//! backoff_ms = 3000
//!
//! [store]
//! backend = "document"
//! path = "/var/lib/mqttbus/events.json"
//! ```

use crate::transport::{qos_from_level, QoS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    pub client: ClientSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Client identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Human-readable name for logs
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// `mqtt://host[:port]` or `mqtts://host[:port]`
    pub broker_url: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// QoS level for publishes and subscriptions (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// How long a QoS 1/2 publish waits for PUBACK/PUBCOMP
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    pub tls: Option<TlsSection>,
    pub last_will: Option<LastWillSection>,
}

/// Custom TLS material; without it `mqtts://` uses the platform roots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

/// Message the broker publishes if this client disappears
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Fixed delay between failed connect attempts
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Document path, required for the `document` backend
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    /// Time `stop` gives running callbacks before abandoning them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Capacity of the inbound message channel
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

fn default_backoff() -> u64 {
    3000
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_inbound_buffer() -> usize {
    256
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusConfig {
    /// Read, parse and validate a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.client.id)?;
        self.mqtt.validate()?;

        if self.reconnect.backoff_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.inbound_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch.inbound_buffer must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Document && self.store.path.is_none() {
            return Err(ConfigError::InvalidConfig(
                "store.path is required for the document backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.client.name.as_deref().unwrap_or(&self.client.id)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect.backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.dispatch.shutdown_grace_ms)
    }

    /// Minimal in-memory configuration pointing at `broker_url`
    pub fn for_broker(client_id: &str, broker_url: &str) -> Self {
        Self {
            client: ClientSection {
                id: client_id.to_string(),
                name: None,
            },
            mqtt: MqttSection {
                broker_url: broker_url.to_string(),
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive(),
                qos: default_qos(),
                connect_timeout_ms: default_connect_timeout(),
                ack_timeout_ms: default_ack_timeout(),
                max_packet_size: default_max_packet_size(),
                tls: None,
                last_will: None,
            },
            reconnect: ReconnectSection::default(),
            store: StoreSection::default(),
            dispatch: DispatchSection::default(),
        }
    }
}

impl MqttSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("mqtt.broker_url '{}': {e}", self.broker_url))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url scheme '{}' is not supported (use mqtt:// or mqtts://)",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url '{}' has no host",
                self.broker_url
            )));
        }

        if qos_from_level(self.qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.ack_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "mqtt.tls.client_cert_path and client_key_path must be set together"
                        .to_string(),
                ));
            }
            if tls.client_cert_path.is_some() && tls.ca_path.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "mqtt.tls client authentication requires ca_path".to_string(),
                ));
            }
        }

        if let Some(will) = &self.last_will {
            crate::routing::matcher::validate_publish_topic(&will.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("mqtt.last_will.topic: {e}"))
            })?;
        }
        Ok(())
    }

    /// Validated QoS; falls back to at-least-once for out-of-range values
    pub fn qos(&self) -> QoS {
        qos_from_level(self.qos).unwrap_or(QoS::AtLeastOnce)
    }

    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_deref())
    }

    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_deref())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

fn get_env_var_optional(name: Option<&str>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

/// Client IDs must match [a-zA-Z0-9._-]+
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }
    Ok(())
}
