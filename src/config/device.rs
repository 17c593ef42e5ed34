//! `[device]` table, read by the sensor simulator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DeviceConfig {
    /// Sent as `nome` in the bind request.
    #[validate(length(min = 1, max = 64, message = "Device name must be between 1 and 64 characters"))]
    pub name: String,

    /// Seconds slept between two readings.
    #[validate(range(min = 1, max = 86400, message = "Measurement interval must be between 1 and 86400 seconds"))]
    pub measurement_interval: u64,

    #[validate(range(min = 100, max = 60000, message = "Bind timeout must be between 100 and 60000 ms"))]
    pub bind_timeout_ms: u64,

    #[validate(range(min = 10, max = 5000, message = "Bind poll interval must be between 10 and 5000 ms"))]
    pub bind_poll_interval_ms: u64,

    /// How often AGUARDE checks for the start command.
    #[validate(range(min = 10, max = 60000, message = "Wait poll interval must be between 10 and 60000 ms"))]
    pub wait_poll_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: "esp32_sim".to_string(),
            measurement_interval: 10,
            bind_timeout_ms: 5000,
            bind_poll_interval_ms: 100,
            wait_poll_interval_ms: 500,
        }
    }
}

impl DeviceConfig {
    pub fn measurement_interval(&self) -> Duration {
        Duration::from_secs(self.measurement_interval)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn bind_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bind_poll_interval_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}
