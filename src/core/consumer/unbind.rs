//! Unbind notices: acknowledged in the log only.
//!
//! Bindings and measurements are kept for the history of the process.

use tracing::{info, warn};

use crate::core::{
    model::SensorId,
    protocol::{decode, UnbindMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    Malformed,
    Acknowledged(SensorId),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnbindHandler;

impl UnbindHandler {
    pub fn handle(&self, payload: &[u8]) -> UnbindOutcome {
        match decode::<UnbindMessage>(payload) {
            Ok(message) => {
                info!("Sensor {} unbound", message.id);
                UnbindOutcome::Acknowledged(message.id)
            }
            Err(e) => {
                warn!("Discarding malformed unbind notice: {}", e);
                UnbindOutcome::Malformed
            }
        }
    }
}
