//! SQLite-backed registry.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE processes (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     name TEXT NOT NULL,
//!     started_at TEXT NOT NULL,
//!     ended_at TEXT
//! );
//! CREATE TABLE sensor_registry (
//!     process_id INTEGER NOT NULL REFERENCES processes(id),
//!     sensor_id INTEGER NOT NULL,
//!     position TEXT NOT NULL,
//!     PRIMARY KEY (process_id, sensor_id)
//! );
//! CREATE TABLE measurements (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     process_id INTEGER NOT NULL REFERENCES processes(id),
//!     sensor_id INTEGER NOT NULL,
//!     rh REAL NOT NULL,
//!     soc REAL NOT NULL,
//!     timestamp TEXT NOT NULL
//! );
//! ```
//!
//! Timestamps are stored as RFC 3339 text in UTC. The connection sits behind
//! a `std::sync::Mutex` and every query runs on the blocking thread pool.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info};

use super::{ProcessAdmin, Registry, RegistryError};
use crate::core::model::{
    Measurement, NewMeasurement, Process, ProcessId, SensorBinding, SensorId, UNKNOWN_POSITION,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT
);
CREATE TABLE IF NOT EXISTS sensor_registry (
    process_id INTEGER NOT NULL REFERENCES processes(id),
    sensor_id INTEGER NOT NULL,
    position TEXT NOT NULL,
    PRIMARY KEY (process_id, sensor_id)
);
CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL REFERENCES processes(id),
    sensor_id INTEGER NOT NULL,
    rh REAL NOT NULL,
    soc REAL NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sensor_registry_sensor ON sensor_registry(sensor_id);
CREATE INDEX IF NOT EXISTS idx_measurements_process ON measurements(process_id);
";

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Storage(e.to_string())
    }
}

pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| {
            RegistryError::Unavailable(format!(
                "failed to open SQLite database at {}: {e}",
                path.display()
            ))
        })?;
        let registry = Self::with_connection(conn)?;
        info!("SQLite registry opened at {}", path.display());
        Ok(registry)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RegistryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RegistryError::Unavailable("SQLite connection lock poisoned".into()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| RegistryError::Unavailable(format!("registry task failed: {e}")))?
    }
}

fn to_text(ts: OffsetDateTime) -> Result<String, RegistryError> {
    ts.format(&Rfc3339)
        .map_err(|e| RegistryError::Storage(format!("timestamp formatting failed: {e}")))
}

fn from_text(idx: usize, text: &str) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn sensor_key(sensor_id: SensorId) -> Result<i64, RegistryError> {
    i64::try_from(sensor_id.get())
        .map_err(|_| RegistryError::Storage(format!("sensor id {sensor_id} out of range")))
}

fn sensor_from_row(idx: usize, row: &Row<'_>) -> rusqlite::Result<SensorId> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map(SensorId).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn row_to_process(row: &Row<'_>) -> rusqlite::Result<Process> {
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    Ok(Process {
        id: row.get(0)?,
        name: row.get(1)?,
        started_at: from_text(2, &started_at)?,
        ended_at: ended_at.map(|t| from_text(3, &t)).transpose()?,
    })
}

fn row_to_binding(row: &Row<'_>) -> rusqlite::Result<SensorBinding> {
    Ok(SensorBinding {
        process_id: row.get(0)?,
        sensor_id: sensor_from_row(1, row)?,
        position: row.get(2)?,
    })
}

fn row_to_measurement(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    let timestamp: String = row.get(5)?;
    Ok(Measurement {
        id: row.get(0)?,
        process_id: row.get(1)?,
        sensor_id: sensor_from_row(2, row)?,
        rh: row.get(3)?,
        soc: row.get(4)?,
        timestamp: from_text(5, &timestamp)?,
    })
}

fn load_process(conn: &Connection, id: ProcessId) -> Result<Option<Process>, RegistryError> {
    Ok(conn
        .query_row(
            "SELECT id, name, started_at, ended_at FROM processes WHERE id = ?1",
            params![id],
            row_to_process,
        )
        .optional()?)
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn find_active_process(&self) -> Result<Option<Process>, RegistryError> {
        self.call(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, started_at, ended_at FROM processes
                     WHERE ended_at IS NULL
                     ORDER BY id ASC
                     LIMIT 1",
                    [],
                    row_to_process,
                )
                .optional()?)
        })
        .await
    }

    async fn register_sensor(
        &self,
        sensor_id: SensorId,
        process_id: ProcessId,
    ) -> Result<SensorBinding, RegistryError> {
        let key = sensor_key(sensor_id)?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if load_process(&tx, process_id)?.is_none() {
                return Err(RegistryError::NotFound(format!("process {process_id}")));
            }
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sensor_registry WHERE process_id = ?1 AND sensor_id = ?2)",
                params![process_id, key],
                |row| row.get(0),
            )?;
            if exists {
                return Err(RegistryError::Conflict(format!(
                    "sensor {sensor_id} already bound to process {process_id}"
                )));
            }
            tx.execute(
                "INSERT INTO sensor_registry (process_id, sensor_id, position) VALUES (?1, ?2, ?3)",
                params![process_id, key, UNKNOWN_POSITION],
            )?;
            tx.commit()?;
            debug!("Registered sensor {} in process {}", sensor_id, process_id);
            Ok(SensorBinding {
                process_id,
                sensor_id,
                position: UNKNOWN_POSITION.to_string(),
            })
        })
        .await
    }

    async fn find_sensor(
        &self,
        sensor_id: SensorId,
    ) -> Result<Option<SensorBinding>, RegistryError> {
        // Ids past i64::MAX cannot be stored, so they are never bound.
        let Ok(key) = sensor_key(sensor_id) else {
            return Ok(None);
        };
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT process_id, sensor_id, position FROM sensor_registry
                     WHERE sensor_id = ?1
                     ORDER BY process_id DESC
                     LIMIT 1",
                    params![key],
                    row_to_binding,
                )
                .optional()?)
        })
        .await
    }

    async fn insert_measurement(
        &self,
        measurement: NewMeasurement,
    ) -> Result<Measurement, RegistryError> {
        let key = sensor_key(measurement.sensor_id)?;
        let timestamp = to_text(measurement.timestamp)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO measurements (process_id, sensor_id, rh, soc, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    measurement.process_id,
                    key,
                    measurement.rh,
                    measurement.soc,
                    timestamp
                ],
            )?;
            Ok(Measurement::from_new(conn.last_insert_rowid(), measurement))
        })
        .await
    }
}

#[async_trait]
impl ProcessAdmin for SqliteRegistry {
    async fn create_process(&self, name: &str) -> Result<Process, RegistryError> {
        let name = name.to_string();
        let started_at = OffsetDateTime::now_utc();
        let started_text = to_text(started_at)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO processes (name, started_at) VALUES (?1, ?2)",
                params![name, started_text],
            )?;
            Ok(Process {
                id: conn.last_insert_rowid(),
                name,
                started_at,
                ended_at: None,
            })
        })
        .await
    }

    async fn end_process(&self, id: ProcessId) -> Result<Process, RegistryError> {
        let ended_text = to_text(OffsetDateTime::now_utc())?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let process = load_process(&tx, id)?
                .ok_or_else(|| RegistryError::NotFound(format!("process {id}")))?;
            if !process.is_active() {
                return Err(RegistryError::Conflict(format!("process {id} already ended")));
            }
            tx.execute(
                "UPDATE processes SET ended_at = ?1 WHERE id = ?2",
                params![ended_text, id],
            )?;
            let ended = load_process(&tx, id)?
                .ok_or_else(|| RegistryError::NotFound(format!("process {id}")))?;
            tx.commit()?;
            Ok(ended)
        })
        .await
    }

    async fn list_processes(&self) -> Result<Vec<Process>, RegistryError> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, started_at, ended_at FROM processes ORDER BY id")?;
            let processes = stmt
                .query_map([], row_to_process)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(processes)
        })
        .await
    }

    async fn measurements_for_process(
        &self,
        id: ProcessId,
    ) -> Result<Vec<Measurement>, RegistryError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, process_id, sensor_id, rh, soc, timestamp FROM measurements
                 WHERE process_id = ?1
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![id], row_to_measurement)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(process_id: ProcessId, sensor_id: u64, rh: f64) -> NewMeasurement {
        NewMeasurement {
            process_id,
            sensor_id: SensorId(sensor_id),
            rh,
            soc: 100.0,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        assert!(registry.find_active_process().await.unwrap().is_none());

        let p1 = registry.create_process("estufa-1").await.unwrap();
        let p2 = registry.create_process("estufa-2").await.unwrap();
        assert_eq!(registry.find_active_process().await.unwrap().unwrap().id, p1.id);

        let ended = registry.end_process(p1.id).await.unwrap();
        assert!(ended.ended_at.is_some());
        assert_eq!(registry.find_active_process().await.unwrap().unwrap().id, p2.id);

        assert!(matches!(
            registry.end_process(p1.id).await,
            Err(RegistryError::Conflict(_))
        ));
        assert!(matches!(
            registry.end_process(404).await,
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(registry.list_processes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bindings() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let p1 = registry.create_process("a").await.unwrap();
        let p2 = registry.create_process("b").await.unwrap();

        let binding = registry.register_sensor(SensorId(501), p1.id).await.unwrap();
        assert_eq!(binding.position, UNKNOWN_POSITION);
        assert!(matches!(
            registry.register_sensor(SensorId(501), p1.id).await,
            Err(RegistryError::Conflict(_))
        ));
        assert!(matches!(
            registry.register_sensor(SensorId(502), 77).await,
            Err(RegistryError::NotFound(_))
        ));

        registry.register_sensor(SensorId(501), p2.id).await.unwrap();
        let found = registry.find_sensor(SensorId(501)).await.unwrap().unwrap();
        assert_eq!(found.process_id, p2.id);
        assert!(registry.find_sensor(SensorId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sensor_id_beyond_storage_range_is_unknown() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let p = registry.create_process("a").await.unwrap();

        assert!(registry.find_sensor(SensorId(u64::MAX)).await.unwrap().is_none());
        assert!(registry
            .find_sensor(SensorId(i64::MAX as u64 + 1))
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            registry.register_sensor(SensorId(u64::MAX), p.id).await,
            Err(RegistryError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_measurements_round_trip() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let p = registry.create_process("a").await.unwrap();

        let stored = registry.insert_measurement(reading(p.id, 9, 42.5)).await.unwrap();
        registry.insert_measurement(reading(p.id, 9, 42.5)).await.unwrap();

        let rows = registry.measurements_for_process(p.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, stored.id);
        assert_eq!(rows[0].rh, 42.5);
        assert_eq!(rows[0].sensor_id, SensorId(9));
        assert_eq!(rows[0].timestamp, stored.timestamp);
    }

    #[tokio::test]
    async fn test_measurement_for_unknown_process_rejected() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let result = registry.insert_measurement(reading(12, 1, 1.0)).await;
        assert!(matches!(result, Err(RegistryError::Storage(_))));
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        {
            let registry = SqliteRegistry::open(&path).unwrap();
            let p = registry.create_process("persisted").await.unwrap();
            registry.register_sensor(SensorId(11), p.id).await.unwrap();
        }
        let registry = SqliteRegistry::open(&path).unwrap();
        let active = registry.find_active_process().await.unwrap().unwrap();
        assert_eq!(active.name, "persisted");
        assert!(registry.find_sensor(SensorId(11)).await.unwrap().is_some());
    }
}
