//! Server-side consumer.
//!
//! ```text
//! Connector ─► worker task ─► Router ─┬─► BindHandler ─────────► Registry, Publisher
//!                                     ├─► MeasurementHandler ──► Registry
//!                                     └─► UnbindHandler
//! ```
//!
//! One worker drains one inbound session and awaits every handler inline, so
//! messages are processed one at a time in delivery order.

pub mod bind;
pub mod lifecycle;
pub mod measurement;
pub mod router;
pub mod unbind;

pub use bind::{BindFailure, BindHandler, BindOutcome};
pub use lifecycle::{Consumer, ConsumerError, ConsumerState};
pub use measurement::{MeasurementHandler, MeasurementOutcome};
pub use router::{Dispatch, Dispatcher, Route, Router};
pub use unbind::{UnbindHandler, UnbindOutcome};
