//! Device side of the protocol: the sensor state machine and its link to the
//! broker. Backs the `greenbee-sensor` simulator and the end-to-end tests.

pub mod link;
pub mod machine;
pub mod sensor;
pub mod signals;
pub mod state;

use greenbee_mqtt::TransferError;
use thiserror::Error;

pub use link::DeviceLink;
pub use machine::DeviceMachine;
pub use sensor::{Sensor, SyntheticSensor};
pub use signals::DeviceSignals;
pub use state::{DeviceState, StopReason};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransferError),

    #[error("No sensor id assigned")]
    Unbound,

    /// The receive side of the device went away; commands and bind
    /// responses can no longer arrive.
    #[error("Connection to the broker lost")]
    ConnectionLost,
}
