//! Registry kept in process memory.
//!
//! Backs tests and demo deployments. Everything is lost on restart.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ProcessAdmin, Registry, RegistryError};
use crate::core::model::{
    Measurement, NewMeasurement, Process, ProcessId, SensorBinding, SensorId, UNKNOWN_POSITION,
};

#[derive(Default)]
struct Tables {
    processes: Vec<Process>,
    bindings: BTreeMap<(ProcessId, SensorId), SensorBinding>,
    measurements: Vec<Measurement>,
}

#[derive(Default)]
pub struct InMemoryRegistry {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every gateway call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn ensure_online(&self) -> Result<(), RegistryError> {
        if self.offline.load(Ordering::Acquire) {
            Err(RegistryError::Unavailable("in-memory registry is offline".into()))
        } else {
            Ok(())
        }
    }

    pub async fn binding_count(&self) -> usize {
        self.tables.read().await.bindings.len()
    }

    pub async fn measurement_count(&self) -> usize {
        self.tables.read().await.measurements.len()
    }

    pub async fn bindings(&self) -> Vec<SensorBinding> {
        self.tables.read().await.bindings.values().cloned().collect()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn find_active_process(&self) -> Result<Option<Process>, RegistryError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables.processes.iter().find(|p| p.is_active()).cloned())
    }

    async fn register_sensor(
        &self,
        sensor_id: SensorId,
        process_id: ProcessId,
    ) -> Result<SensorBinding, RegistryError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;

        if !tables.processes.iter().any(|p| p.id == process_id) {
            return Err(RegistryError::NotFound(format!("process {process_id}")));
        }
        if tables.bindings.contains_key(&(process_id, sensor_id)) {
            return Err(RegistryError::Conflict(format!(
                "sensor {sensor_id} already bound to process {process_id}"
            )));
        }

        let binding = SensorBinding {
            process_id,
            sensor_id,
            position: UNKNOWN_POSITION.to_string(),
        };
        tables
            .bindings
            .insert((process_id, sensor_id), binding.clone());
        debug!("Registered sensor {} in process {}", sensor_id, process_id);
        Ok(binding)
    }

    async fn find_sensor(
        &self,
        sensor_id: SensorId,
    ) -> Result<Option<SensorBinding>, RegistryError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .bindings
            .values()
            .filter(|b| b.sensor_id == sensor_id)
            .max_by_key(|b| b.process_id)
            .cloned())
    }

    async fn insert_measurement(
        &self,
        measurement: NewMeasurement,
    ) -> Result<Measurement, RegistryError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let id = tables.measurements.len() as i64 + 1;
        let row = Measurement::from_new(id, measurement);
        tables.measurements.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl ProcessAdmin for InMemoryRegistry {
    async fn create_process(&self, name: &str) -> Result<Process, RegistryError> {
        let mut tables = self.tables.write().await;
        let process = Process {
            id: tables.processes.len() as ProcessId + 1,
            name: name.to_string(),
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
        };
        tables.processes.push(process.clone());
        Ok(process)
    }

    async fn end_process(&self, id: ProcessId) -> Result<Process, RegistryError> {
        let mut tables = self.tables.write().await;
        let process = tables
            .processes
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| RegistryError::NotFound(format!("process {id}")))?;
        if !process.is_active() {
            return Err(RegistryError::Conflict(format!("process {id} already ended")));
        }
        process.ended_at = Some(OffsetDateTime::now_utc());
        Ok(process.clone())
    }

    async fn list_processes(&self) -> Result<Vec<Process>, RegistryError> {
        Ok(self.tables.read().await.processes.clone())
    }

    async fn measurements_for_process(
        &self,
        id: ProcessId,
    ) -> Result<Vec<Measurement>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .measurements
            .iter()
            .filter(|m| m.process_id == id)
            .cloned()
            .collect())
    }
}
