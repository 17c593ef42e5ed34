//! Protocol core shared by the server, the sensor simulator and the
//! operator tool.

pub mod consumer;
pub mod device;
pub mod identity;
pub mod loopback;
pub mod model;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod transport;
