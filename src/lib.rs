//! greenbee: sensor binding and measurement ingestion over MQTT.
//!
//! Field sensors join the currently active measurement campaign ("process")
//! without a pre-provisioned identity. A sensor asks for an id on the bind
//! request topic, the server allocates one, records the binding and answers
//! on the bind response topic, and from then on the sensor streams readings
//! that the server stores against the process.
//!
//! ## Modules
//!
//! * `config`: TOML configuration for every component, validated with the
//!   `validator` crate.
//! * `core`: the protocol itself:
//!   - payload types and the registry gateway
//!   - the server-side consumer (router, handlers, worker lifecycle)
//!   - the device state machine run by sensors and the simulator
//! * `logger`: `tracing` subscriber setup (console and journald).
//!
//! Broker plumbing lives in the `greenbee-mqtt` workspace crate.

pub mod config;
pub mod core;
pub mod logger;
