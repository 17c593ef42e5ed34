//! Wire payloads of the bind and measurement protocol.
//!
//! | Topic key     | Payload                                     |
//! |---------------|---------------------------------------------|
//! | measurement   | `{"id": "<sensor_id>", "medicao": <number>}` |
//! | bind_request  | `{"req_id": "<uuid>", "nome": "<string>"}`   |
//! | bind_response | `{"req_id", "id", "status": "ok" \| "fail"}` |
//! | unbind        | `{"id": "<sensor_id>"}`                      |
//! | process       | `iniciar` / `finalizar` (plain text)         |
//! | status        | `sleeping` / `cleanup` / `shutdown`          |

use std::{fmt, str::FromStr};

use serde::{de, de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::model::SensorId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Unknown process command: '{0}'")]
    UnknownCommand(String),

    #[error("Unknown device status: '{0}'")]
    UnknownStatus(String),
}

/// Parses a JSON payload into `T`.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    /// Correlation id chosen by the device, echoed verbatim in the response.
    pub req_id: String,
    #[serde(rename = "nome", alias = "name")]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindStatus {
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResponse {
    pub req_id: String,
    /// Decimal sensor id, empty on failure.
    #[serde(default)]
    pub id: String,
    pub status: BindStatus,
}

impl BindResponse {
    pub fn ok(req_id: impl Into<String>, sensor_id: SensorId) -> Self {
        BindResponse {
            req_id: req_id.into(),
            id: sensor_id.to_string(),
            status: BindStatus::Ok,
        }
    }

    pub fn fail(req_id: impl Into<String>) -> Self {
        BindResponse {
            req_id: req_id.into(),
            id: String::new(),
            status: BindStatus::Fail,
        }
    }

    /// The assigned id, if the bind succeeded and the id parses.
    pub fn assigned_id(&self) -> Option<SensorId> {
        match self.status {
            BindStatus::Ok => self.id.parse().ok(),
            BindStatus::Fail => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMessage {
    pub id: SensorId,
    /// Relative humidity reading.
    #[serde(deserialize_with = "lenient_number")]
    pub medicao: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindMessage {
    pub id: SensorId,
}

/// Accepts a JSON number or a string holding one. Non-finite values are
/// rejected.
fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    struct NumberVisitor;

    impl de::Visitor<'_> for NumberVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a finite number or a numeric string")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            if v.is_finite() {
                Ok(v)
            } else {
                Err(E::invalid_value(de::Unexpected::Float(v), &self))
            }
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            let parsed: f64 = v
                .trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))?;
            self.visit_f64(parsed)
        }
    }

    deserializer.deserialize_any(NumberVisitor)
}

/// Plain-text command on the process topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommand {
    Start,
    Finish,
}

impl ProcessCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessCommand::Start => "iniciar",
            ProcessCommand::Finish => "finalizar",
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        std::str::from_utf8(payload)?.parse()
    }
}

impl FromStr for ProcessCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "iniciar" => Ok(ProcessCommand::Start),
            "finalizar" => Ok(ProcessCommand::Finish),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-text lifecycle notice on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Sleeping,
    Cleanup,
    Shutdown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Sleeping => "sleeping",
            DeviceStatus::Cleanup => "cleanup",
            DeviceStatus::Shutdown => "shutdown",
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sleeping" => Ok(DeviceStatus::Sleeping),
            "cleanup" => Ok(DeviceStatus::Cleanup),
            "shutdown" => Ok(DeviceStatus::Shutdown),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_request_accepts_both_name_keys() {
        let pt: BindRequest = decode(br#"{"req_id":"r1","nome":"s1"}"#).unwrap();
        let en: BindRequest = decode(br#"{"req_id":"r1","name":"s1"}"#).unwrap();
        assert_eq!(pt, en);
        assert_eq!(
            serde_json::to_value(&pt).unwrap(),
            serde_json::json!({"req_id": "r1", "nome": "s1"})
        );
    }

    #[test]
    fn test_bind_request_rejects_bad_shapes() {
        assert!(decode::<BindRequest>(b"not json").is_err());
        assert!(decode::<BindRequest>(br#"{"req_id":"r1"}"#).is_err());
        assert!(decode::<BindRequest>(br#"{"req_id":7,"nome":"s1"}"#).is_err());
    }

    #[test]
    fn test_bind_response_shapes() {
        let ok = BindResponse::ok("r1", SensorId(904_213));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"req_id": "r1", "id": "904213", "status": "ok"})
        );
        assert_eq!(ok.assigned_id(), Some(SensorId(904_213)));

        let fail = BindResponse::fail("r2");
        assert_eq!(
            serde_json::to_value(&fail).unwrap(),
            serde_json::json!({"req_id": "r2", "id": "", "status": "fail"})
        );
        assert_eq!(fail.assigned_id(), None);
    }

    #[test]
    fn test_measurement_lenient_fields() {
        let a: MeasurementMessage = decode(br#"{"id":"12","medicao":42.5}"#).unwrap();
        let b: MeasurementMessage = decode(br#"{"id":12,"medicao":"42.5"}"#).unwrap();
        assert_eq!(a, b);
        let c: MeasurementMessage = decode(br#"{"id":"12","medicao":40}"#).unwrap();
        assert_eq!(c.medicao, 40.0);
    }

    #[test]
    fn test_measurement_rejects_non_numeric() {
        assert!(decode::<MeasurementMessage>(br#"{"id":"12","medicao":"wet"}"#).is_err());
        assert!(decode::<MeasurementMessage>(br#"{"id":"12","medicao":"NaN"}"#).is_err());
        assert!(decode::<MeasurementMessage>(br#"{"id":"12"}"#).is_err());
        assert!(decode::<MeasurementMessage>(br#"{"id":"x","medicao":1}"#).is_err());
    }

    #[test]
    fn test_process_command_text() {
        assert_eq!(
            ProcessCommand::from_payload(b"iniciar").unwrap(),
            ProcessCommand::Start
        );
        assert_eq!(
            ProcessCommand::from_payload(b"finalizar\n").unwrap(),
            ProcessCommand::Finish
        );
        assert!(matches!(
            ProcessCommand::from_payload(b"pausar"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            ProcessCommand::from_payload(&[0xff, 0xfe]),
            Err(ProtocolError::Utf8(_))
        ));
    }

    #[test]
    fn test_device_status_text() {
        for status in [DeviceStatus::Sleeping, DeviceStatus::Cleanup, DeviceStatus::Shutdown] {
            assert_eq!(status.as_str().parse::<DeviceStatus>().unwrap(), status);
        }
        assert!("awake".parse::<DeviceStatus>().is_err());
    }
}
