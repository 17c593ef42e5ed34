//! Error type shared by every transport operation.
//!
//! `TransferError` folds together configuration problems, broker/network
//! failures and backoff exhaustion so that callers above the transport can
//! match on one enum. The variants fall into three groups:
//!
//! **Setup** (caught at startup):
//! - `ClientSetup`, `ConfigError`, `InvalidTopic`
//!
//! **Runtime** (transient or fatal connectivity problems):
//! - `ClientTransfer`, `ClientConnection`, `ConnectionState`, `ConnectTimeout`,
//!   `SubscribeRejected`, `Closed`
//!
//! **Policy**:
//! - `RetriesPolicy` when the backoff gives up
//!
//! Callers in the service treat every variant the same way at the handler
//! boundary: log it and report a failed operation.

use thiserror::Error;

/// Every failure a transport operation can report.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Topic is empty or contains wildcard characters where a concrete
    /// topic is required.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Payload could not be encoded before publishing.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Client could not be constructed from the supplied options.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// The connection kernel could not be started or is gone.
    #[error("Connection kernel error: {0}")]
    ConnectionKernel(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request could not be queued on the client's channel
    /// (event loop dropped or channel closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level or protocol-level connection failure.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// rumqttc state machine rejected a transition.
    #[error("Client connection state error: {0}")]
    ConnectionState(#[from] rumqttc::StateError),

    /// No CONNACK arrived within the configured connection timeout.
    #[error("Connection timed out after {0} seconds")]
    ConnectTimeout(u64),

    /// Broker answered SUBSCRIBE with a failure return code.
    #[error("Subscription to '{0}' rejected by broker")]
    SubscribeRejected(String),

    /// Session was closed before the operation completed.
    #[error("Session closed")]
    Closed,

    /// Backoff policy exhausted.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    /// Local I/O failure outside the client, e.g. while resolving the broker.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

impl TransferError {
    /// Returns true for errors caused by the broker or the network rather than
    /// by local configuration.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransferError::ClientConnection(_)
                | TransferError::ConnectTimeout(_)
                | TransferError::Closed
                | TransferError::ClientTransfer(_)
        )
    }
}
