//! Records kept by the registry.
//!
//! All timestamps are UTC.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

pub type ProcessId = i64;

/// Position recorded for sensors registered through the bind protocol.
pub const UNKNOWN_POSITION: &str = "unknown";

/// Identity handed to a sensor by the bind protocol.
///
/// Rendered as a decimal string on the wire. Deserialisation also accepts a
/// JSON integer, since some firmware sends the id unquoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId(pub u64);

impl SensorId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SensorId {
    fn from(value: u64) -> Self {
        SensorId(value)
    }
}

impl FromStr for SensorId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(SensorId)
    }
}

impl Serialize for SensorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SensorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SensorIdVisitor;

        impl de::Visitor<'_> for SensorIdVisitor {
            type Value = SensorId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sensor id as a decimal string or a non-negative integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SensorId, E> {
                Ok(SensorId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SensorId, E> {
                u64::try_from(v)
                    .map(SensorId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SensorId, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(SensorIdVisitor)
    }
}

/// A measurement campaign. Active while `ended_at` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl Process {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Membership of a sensor in a process. Keyed by `(process_id, sensor_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorBinding {
    pub process_id: ProcessId,
    pub sensor_id: SensorId,
    pub position: String,
}

/// A measurement waiting for its row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeasurement {
    pub process_id: ProcessId,
    pub sensor_id: SensorId,
    pub rh: f64,
    pub soc: f64,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub process_id: ProcessId,
    pub sensor_id: SensorId,
    pub rh: f64,
    pub soc: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Measurement {
    pub fn from_new(id: i64, new: NewMeasurement) -> Self {
        Measurement {
            id,
            process_id: new.process_id,
            sensor_id: new.sensor_id,
            rh: new.rh,
            soc: new.soc,
            timestamp: new.timestamp,
        }
    }
}
