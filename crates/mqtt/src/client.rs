//! Builder for rumqttc's `AsyncClient` / `EventLoop` pair.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?
//!     .last_will("sensores/status", "shutdown", QoS::AtMostOnce, false)
//!     .build();
//! ```
//!
//! The client is cheap to clone and safe to use from any task. The event loop
//! must be polled by exactly one task; nothing is sent or received otherwise.

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use validator::Validate;

use super::{config::Config, error::TransferError};

/// Capacity used when the config leaves `request_channel_capacity` unset.
const DEFAULT_CHANNEL_CAPACITY: usize = 10;

pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
}

impl ClientBuilder {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap: cap.max(1),
        }
    }

    /// Validates `config` and maps it onto MQTT options.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        opts.set_inflight(config.max_inflight);
        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        let cap = config
            .request_channel_capacity
            .map(usize::from)
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);

        Ok(Self { opts, cap })
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    /// Message the broker publishes on our behalf if the connection drops
    /// without a DISCONNECT.
    pub fn last_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        let will = LastWill::new(topic.into(), payload.into(), qos, retain);
        self.opts.set_last_will(will);
        self
    }

    pub fn client_id(&self) -> String {
        self.opts.client_id()
    }

    pub fn build(self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.opts, self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_uses_client_id() {
        let config = Config {
            client_id: "greenbee-test".into(),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.client_id(), "greenbee-test");
        let (_client, _event_loop) = builder.build();
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_long_client_id() {
        let config = Config {
            client_id: "x".repeat(40),
            ..Default::default()
        };
        assert!(ClientBuilder::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_fluent_options() {
        let (_client, event_loop) = ClientBuilder::new("dev", "localhost", 1883, 0)
            .keep_alive(30)
            .clean_session(true)
            .max_inflight(5)
            .last_will("sensores/status", "shutdown", QoS::AtMostOnce, false)
            .build();
        assert_eq!(event_loop.mqtt_options.keep_alive(), Duration::from_secs(30));
        assert!(event_loop.mqtt_options.clean_session());
        assert!(event_loop.mqtt_options.last_will().is_some());
    }
}
