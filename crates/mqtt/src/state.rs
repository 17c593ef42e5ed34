//! Observable connection state.
//!
//! Both the session and the reconnecting kernel publish their state on a
//! `tokio::sync::watch` channel so other tasks can react without polling.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// TCP/MQTT handshake in progress.
    Connecting,

    /// CONNACK received with a success code.
    Connected,

    /// Connection lost or refused; carries the reason.
    Disconnected(String),

    /// Waiting the given number of seconds before the next attempt.
    Reconnecting(f64),

    /// Closed on request of the owner.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Closed => "Closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True once nothing more will happen on this connection without outside help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::Disconnected(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
            ConnectionState::Reconnecting(secs) => write!(f, "Reconnecting (in {secs:.1}s)"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("broker gone".into()).to_string(),
            "Disconnected (broker gone)"
        );
        assert_eq!(
            ConnectionState::Reconnecting(2.0).to_string(),
            "Reconnecting (in 2.0s)"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Disconnected(String::new()).is_terminal());
        assert!(!ConnectionState::Reconnecting(1.0).is_terminal());
    }
}
