//! `[consumer]` table.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Seconds `stop()` waits for the worker before giving up on it.
    #[validate(range(min = 1, max = 300, message = "Stop timeout must be between 1 and 300 seconds"))]
    pub stop_timeout: u64,

    /// Stored as `soc` on every measurement until devices report a real value.
    #[validate(range(min = 0.0, max = 100.0, message = "Placeholder soc must be between 0 and 100"))]
    pub placeholder_soc: f64,

    /// Identity draws checked against the registry before a bind gives up.
    /// `0` skips the check.
    #[validate(range(max = 16, message = "Identity attempts must be between 0 and 16"))]
    pub identity_attempts: u8,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            stop_timeout: 5,
            placeholder_soc: 100.0,
            identity_attempts: 3,
        }
    }
}

impl ConsumerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }
}
