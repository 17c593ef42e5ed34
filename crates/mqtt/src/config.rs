//! Broker connection settings.
//!
//! Loaded as the `[transport]` table of the service configuration. Every field
//! has a default so a minimal file only needs `host`:
//!
//! ```toml
//! [transport]
//! host = "mqtt.local"
//! port = 1883
//! qos = 0
//! ```
//!
//! # Base topic
//!
//! `base_topic` namespaces every topic the session publishes or subscribes to.
//! It is prefixed on the way out and stripped from inbound topics, so the rest
//! of the service always sees bare topics such as `sensores/medicao`.

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::error::TransferError;

/// Longest client id accepted by the validation rules.
pub const MAX_CLIENT_ID_LEN: usize = 36;

/// The `[transport]` table. Each binary derives its own client id from it
/// with [`Config::with_client_suffix`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Namespace prefix; empty disables it.
    #[validate(
        length(max = 255, message = "Base topic must not exceed 255 characters"),
        custom(function = "validate_base_topic")
    )]
    pub base_topic: String,

    /// Broker host name or address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker TCP port.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Seconds to wait for CONNACK (and SUBACK) before giving up.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Ask the broker to drop session state on connect.
    pub clean_session: bool,

    /// Outgoing QoS 1/2 publishes awaiting acknowledgement.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Seconds between PINGREQs on an idle connection.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Generated (UUID v4) when not configured.
    #[validate(length(
        min = 1,
        max = 36,
        message = "Client ID must be between 1 and 36 characters"
    ))]
    pub client_id: String,

    /// Largest packet accepted in either direction, in bytes.
    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Requests queued towards the event loop before `publish` awaits.
    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: Option<u8>,

    /// QoS used for every publish and subscription. `0` keeps the
    /// at-most-once semantics the protocol is designed around.
    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,

    /// Initial reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Upper bound for the reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Max reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub max_reconnect_delay: u64,

    /// `0` retries forever.
    #[validate(range(
        max = 100,
        message = "Max reconnect attempts must be between 0 and 100"
    ))]
    pub max_reconnect_attempts: u64,

    /// Backoff multiplier.
    #[validate(range(
        min = 1,
        max = 30,
        message = "Reconnect backoff delimiter must be between 1 and 30"
    ))]
    pub reconnect_backoff_delimiter: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_topic: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            connection_timeout: 30,
            clean_session: true,
            max_inflight: 10,
            keep_alive: 60,
            client_id: Uuid::new_v4().to_string(),
            max_packet_size: Some(65_535),
            request_channel_capacity: Some(10),
            qos: 0,
            reconnect_delay: 1,
            max_reconnect_delay: 60,
            max_reconnect_attempts: 0,
            reconnect_backoff_delimiter: 2,
        }
    }
}

impl Config {
    /// Copy of this config with `-<suffix>` appended to the client id.
    ///
    /// The service opens more than one connection per process and the broker
    /// drops the older session on an id collision. The base id is shortened so
    /// the result still passes validation.
    pub fn with_client_suffix(&self, suffix: &str) -> Config {
        let room = MAX_CLIENT_ID_LEN.saturating_sub(suffix.len() + 1);
        let base: String = self.client_id.chars().take(room).collect();
        Config {
            client_id: format!("{base}-{suffix}"),
            ..self.clone()
        }
    }

    /// The configured QoS as a `rumqttc` level.
    pub fn qos(&self) -> Result<QoS, TransferError> {
        qos_from_u8(self.qos)
    }
}

pub fn qos_from_u8(qos: u8) -> Result<QoS, TransferError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::ClientSetup(format!(
            "Invalid QoS value {other}, must be 0, 1 or 2"
        ))),
    }
}

/// Checks that `topic` names a single concrete topic: non-empty and free of
/// the `+` and `#` wildcards.
pub fn validate_concrete_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::new("empty_topic").with_message("Topic must not be empty".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(ValidationError::new("wildcard_topic")
            .with_message(format!("Topic '{topic}' must not contain wildcards").into()));
    }
    Ok(())
}

fn validate_base_topic(base_topic: &str) -> Result<(), ValidationError> {
    if base_topic.is_empty() {
        return Ok(());
    }
    validate_concrete_topic(base_topic)
}
