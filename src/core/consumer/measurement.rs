//! Measurement ingestion: one stored row per reading from a bound sensor.
//!
//! Readings from unknown sensors and malformed payloads are dropped. Nothing
//! is ever published back.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::core::{
    model::{Measurement, NewMeasurement, SensorId},
    protocol::{decode, MeasurementMessage},
    registry::Registry,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementOutcome {
    Malformed,
    UnknownSensor(SensorId),
    Stored(Measurement),
    StorageFailed,
}

pub struct MeasurementHandler {
    registry: Arc<dyn Registry>,
    placeholder_soc: f64,
}

impl MeasurementHandler {
    pub fn new(registry: Arc<dyn Registry>, placeholder_soc: f64) -> Self {
        Self {
            registry,
            placeholder_soc,
        }
    }

    pub async fn handle(&self, payload: &[u8]) -> MeasurementOutcome {
        let message: MeasurementMessage = match decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed measurement: {}", e);
                return MeasurementOutcome::Malformed;
            }
        };

        let binding = match self.registry.find_sensor(message.id).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                warn!("Measurement from unknown sensor {} dropped", message.id);
                return MeasurementOutcome::UnknownSensor(message.id);
            }
            Err(e) => {
                error!("Sensor lookup for {} failed: {}", message.id, e);
                return MeasurementOutcome::StorageFailed;
            }
        };

        let row = NewMeasurement {
            process_id: binding.process_id,
            sensor_id: message.id,
            rh: message.medicao,
            soc: self.placeholder_soc,
            timestamp: OffsetDateTime::now_utc(),
        };
        match self.registry.insert_measurement(row).await {
            Ok(stored) => {
                debug!(
                    "Stored measurement {} from sensor {} (rh={})",
                    stored.id, stored.sensor_id, stored.rh
                );
                MeasurementOutcome::Stored(stored)
            }
            Err(e) => {
                error!("Could not store measurement from sensor {}: {}", message.id, e);
                MeasurementOutcome::StorageFailed
            }
        }
    }
}
