//! # greenbee-mqtt
//!
//! MQTT plumbing for the greenbee service, built on `rumqttc`:
//!
//! - [`Session`]: one connection with an explicit lifecycle. Connect,
//!   subscribe (waiting for SUBACK), publish, drain inbound messages in order,
//!   disconnect. Failures are returned, never retried.
//! - [`MqttManager`] / [`MqttInstance`] / [`Publisher`]: a long-lived outbound
//!   connection whose [`ConnectionKernel`] reconnects with exponential
//!   [`Backoff`]. Publishing is safe from any number of tasks.
//! - [`Config`]: validated broker settings, usually the `[transport]` table of
//!   the service configuration.
//!
//! ```ignore
//! let instance = MqttManager::from_config(config.with_client_suffix("pub")).build_and_start()?;
//! let publisher = Publisher::new(Arc::new(instance));
//! publisher.publish("sensores/processo", "iniciar", false).await?;
//!
//! let mut session = Session::connect(&config.with_client_suffix("sub")).await?;
//! session.subscribe("sensores/medicao").await?;
//! while let Some(message) = session.next_message().await? {
//!     println!("{} -> {:?}", message.topic, message.payload);
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod session;
pub mod state;
pub mod topic;

pub use backoff::{Backoff, BackoffError};
pub use client::ClientBuilder;
pub use config::Config;
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager, PublishDrain};
pub use publisher::Publisher;
pub use rumqttc::QoS;
pub use session::{InboundMessage, Session, SessionHandle};
pub use state::ConnectionState;
pub use topic::TopicNamespace;

pub type Result<T> = std::result::Result<T, TransferError>;
