//! `[topics]` table: the six protocol topics.

use greenbee_mqtt::config::validate_concrete_topic;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_distinct_inbound"))]
pub struct TopicsConfig {
    /// Device to server: `{"id", "medicao"}`.
    #[validate(custom(function = "validate_concrete_topic"))]
    pub measurement: String,

    /// Device to server: `{"req_id", "nome"}`.
    #[validate(custom(function = "validate_concrete_topic"))]
    pub bind_request: String,

    /// Server to device: `{"req_id", "id", "status"}`.
    #[validate(custom(function = "validate_concrete_topic"))]
    pub bind_response: String,

    /// Device to server: `{"id"}`.
    #[validate(custom(function = "validate_concrete_topic"))]
    pub unbind: String,

    /// Server to device: `iniciar` or `finalizar`.
    #[validate(custom(function = "validate_concrete_topic"))]
    pub process: String,

    /// Device to server: `sleeping`, `cleanup` or `shutdown`.
    #[validate(custom(function = "validate_concrete_topic"))]
    pub status: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        TopicsConfig {
            measurement: "sensores/medicao".to_string(),
            bind_request: "sensores/bind/request".to_string(),
            bind_response: "sensores/bind/response".to_string(),
            unbind: "sensores/bind/unbind".to_string(),
            process: "sensores/processo".to_string(),
            status: "sensores/status".to_string(),
        }
    }
}

impl TopicsConfig {
    /// Topics the server consumer subscribes to.
    pub fn inbound(&self) -> [&str; 3] {
        [&self.measurement, &self.bind_request, &self.unbind]
    }

    /// Topics a device subscribes to.
    pub fn device_inbound(&self) -> [&str; 2] {
        [&self.process, &self.bind_response]
    }
}

fn validate_distinct_inbound(topics: &TopicsConfig) -> Result<(), ValidationError> {
    let [a, b, c] = topics.inbound();
    if a == b || a == c || b == c {
        return Err(ValidationError::new("duplicate_inbound_topic")
            .with_message("measurement, bind_request and unbind topics must differ".into()));
    }
    if topics.process == topics.bind_response {
        return Err(ValidationError::new("duplicate_device_topic")
            .with_message("process and bind_response topics must differ".into()));
    }
    Ok(())
}
