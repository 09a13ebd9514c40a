//! MQTT option building
//!
//! Turns a broker URL plus the `[mqtt]` config section into `MqttOptions`.
//! Only the TLS material loading touches the filesystem.

use crate::config::{MqttSection, TlsSection};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// rumqttc transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker URL scheme '{0}' (use mqtt:// or mqtts://)")]
    UnsupportedScheme(String),
    #[error("Failed to read TLS material {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker rejected connection: {0}")]
    ConnectionRejected(String),
    #[error("No CONNACK within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection closed before the broker acknowledged the publish")]
    NotAcknowledged,
    #[error("No publish acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected")]
    NotConnected,
}

/// Broker endpoint parsed from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://` / `mqtts://` URLs (`tcp://` and `ssl://` are aliases)
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => return Err(MqttError::UnsupportedScheme(other.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Per-connection client id; the suffix keeps a reconnect from colliding
/// with the broker's view of the previous session
pub fn session_client_id(client_id: &str) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{client_id}-{millis}")
}

/// Build options for one connection attempt
pub fn configure_mqtt_options(
    client_id: &str,
    broker_url: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let endpoint = parse_broker_url(broker_url)?;
    let mut mqtt_options = MqttOptions::new(session_client_id(client_id), endpoint.host, endpoint.port);

    if endpoint.tls {
        let transport = match &config.tls {
            Some(tls) => match load_tls_configuration(tls)? {
                Some(tls_config) => RumqttcTransport::Tls(tls_config),
                None => RumqttcTransport::tls_with_default_config(),
            },
            None => RumqttcTransport::tls_with_default_config(),
        };
        mqtt_options.set_transport(transport);
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(config.max_packet_size));

    if let Some(will) = &config.last_will {
        let lwt = LastWill::new(
            &will.topic,
            will.payload.clone(),
            config.qos(),
            will.retain,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}

/// Custom CA (and optional client auth); `None` means use the platform roots
pub fn load_tls_configuration(tls: &TlsSection) -> Result<Option<TlsConfiguration>, MqttError> {
    let Some(ca_path) = &tls.ca_path else {
        return Ok(None);
    };

    let ca = read_material(ca_path)?;
    let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert), Some(key)) => Some((read_material(cert)?, read_material(key)?)),
        _ => None,
    };

    Ok(Some(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_material(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}
