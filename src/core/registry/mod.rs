//! Registry gateway: processes, sensor bindings and measurements.
//!
//! The consumer only sees [`Registry`], the four operations the protocol
//! needs. [`ProcessAdmin`] carries the operator-side operations used by
//! `greenbeectl` and by the server's optional bootstrap process.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::model::{Measurement, NewMeasurement, Process, ProcessId, SensorBinding, SensorId};
use crate::config::registry::{RegistryBackend, RegistryConfig};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryRegistry;
pub use sqlite::SqliteRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// The first active process in creation order, if any.
    async fn find_active_process(&self) -> Result<Option<Process>, RegistryError>;

    /// Binds `sensor_id` to `process_id` with position "unknown".
    ///
    /// Fails with `Conflict` if the pair exists and `NotFound` if the process
    /// does not.
    async fn register_sensor(
        &self,
        sensor_id: SensorId,
        process_id: ProcessId,
    ) -> Result<SensorBinding, RegistryError>;

    /// The binding of `sensor_id`. A sensor bound in several processes
    /// resolves to the most recent process.
    async fn find_sensor(&self, sensor_id: SensorId)
        -> Result<Option<SensorBinding>, RegistryError>;

    async fn insert_measurement(
        &self,
        measurement: NewMeasurement,
    ) -> Result<Measurement, RegistryError>;
}

#[async_trait]
pub trait ProcessAdmin: Send + Sync {
    async fn create_process(&self, name: &str) -> Result<Process, RegistryError>;

    /// Marks an active process as ended.
    async fn end_process(&self, id: ProcessId) -> Result<Process, RegistryError>;

    async fn list_processes(&self) -> Result<Vec<Process>, RegistryError>;

    async fn measurements_for_process(
        &self,
        id: ProcessId,
    ) -> Result<Vec<Measurement>, RegistryError>;
}

/// Both faces of one backend.
#[derive(Clone)]
pub struct RegistryHandles {
    pub gateway: Arc<dyn Registry>,
    pub admin: Arc<dyn ProcessAdmin>,
}

impl RegistryHandles {
    pub fn from_backend<R>(registry: Arc<R>) -> Self
    where
        R: Registry + ProcessAdmin + 'static,
    {
        RegistryHandles {
            gateway: registry.clone(),
            admin: registry,
        }
    }

    /// Returns the active process, creating `name` when there is none.
    pub async fn ensure_active_process(&self, name: &str) -> Result<Process, RegistryError> {
        if let Some(active) = self.gateway.find_active_process().await? {
            return Ok(active);
        }
        self.admin.create_process(name).await
    }
}

/// Opens the backend selected in the `[registry]` table.
pub fn open(config: &RegistryConfig) -> Result<RegistryHandles, RegistryError> {
    match config.backend {
        RegistryBackend::Memory => Ok(RegistryHandles::from_backend(Arc::new(
            InMemoryRegistry::new(),
        ))),
        RegistryBackend::Sqlite => Ok(RegistryHandles::from_backend(Arc::new(
            SqliteRegistry::open(&config.path)?,
        ))),
    }
}
