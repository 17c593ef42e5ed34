//! Inbound transport seam.
//!
//! The consumer worker and the device link drain messages through
//! [`InboundSession`], obtained from a [`Connector`]. The MQTT implementation
//! wraps [`greenbee_mqtt::Session`]; tests and demos use the loopback bus.

use async_trait::async_trait;
use greenbee_mqtt::{Backoff, ClientBuilder, InboundMessage, Session, TransferError};
use tracing::debug;

use crate::config::TransportConfig;

#[async_trait]
pub trait InboundSession: Send {
    /// Subscribes to one concrete topic, returning once the broker accepted it.
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransferError>;

    /// Next message in delivery order; `None` once the session is closed.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransferError>;

    async fn disconnect(&mut self) -> Result<(), TransferError>;
}

/// Factory for inbound sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn InboundSession>, TransferError>;

    /// Retry policy for failed connection attempts.
    fn backoff(&self) -> Backoff;
}

#[async_trait]
impl InboundSession for Session {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransferError> {
        Session::subscribe(self, topic).await
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransferError> {
        Session::next_message(self).await
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        Session::disconnect(self).await
    }
}

/// Opens [`Session`]s to the configured broker.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: TransportConfig,
}

impl MqttConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> Result<Box<dyn InboundSession>, TransferError> {
        debug!(
            "Opening inbound session as '{}' to {}:{}",
            self.config.client_id, self.config.host, self.config.port
        );
        let builder = ClientBuilder::from_config(&self.config)?;
        let session = Session::connect_with(builder, &self.config).await?;
        Ok(Box::new(session))
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_config(&self.config)
    }
}
