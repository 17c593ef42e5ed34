//! Outbound publisher on top of an [`MqttInstance`].
//!
//! Safe to clone and call from many tasks at once: every call only queues a
//! request on the rumqttc channel, and the connection kernel serialises them
//! onto the wire.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::{config::validate_concrete_topic, manager::MqttInstance, TransferError};

#[derive(Clone)]
pub struct Publisher {
    instance: Arc<MqttInstance>,
}

impl Publisher {
    pub fn new(instance: Arc<MqttInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &MqttInstance {
        &self.instance
    }

    /// Publishes raw bytes to `topic` (base topic applied).
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), TransferError> {
        if self.instance.is_shutting_down() {
            return Err(TransferError::Closed);
        }
        validate_concrete_topic(topic).map_err(|_| TransferError::InvalidTopic(topic.to_string()))?;

        let _guard = self.instance.publish_drain().enter();
        let full_topic = self.instance.namespace().apply(topic);
        let payload = payload.into();

        debug!(
            "Publishing to topic '{}' (full: '{}'): {} bytes, retain={}",
            topic,
            full_topic,
            payload.len(),
            retain
        );

        self.instance
            .client()
            .publish(full_topic, self.instance.qos(), retain, payload)
            .await?;
        Ok(())
    }

    /// Serialises `data` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        data: &T,
        retain: bool,
    ) -> Result<(), TransferError> {
        let payload =
            serde_json::to_vec(data).map_err(|e| TransferError::Serialization(e.to_string()))?;
        self.publish(topic, payload, retain).await
    }
}
