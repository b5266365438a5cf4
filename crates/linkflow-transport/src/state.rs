/*!
 * Connection states and the notifications emitted when they change.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use linkflow_core::types::Id;

/// Why a link ended up in the failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The host refused or never answered
    Unreachable,
    /// The device rejected our credentials
    AuthenticationRejected,
    /// The device violated its protocol
    Protocol,
    /// The link was closed on our side (write error, local teardown)
    LocalClose,
    /// The device closed the link
    PeerClosed,
    /// The receive buffer overflowed without a delimiter
    FramingOverflow,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// The transport is up
    Connected,
    /// Disconnected on request
    Disconnected,
    /// The last attempt or session failed
    Failed(FailureKind),
}

impl ConnectionState {
    /// Check if the link is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the link is in a failed state
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    /// Numeric status code for diagnostics; distinct per state and failure kind
    pub fn status_code(&self) -> u16 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnected => 3,
            ConnectionState::Failed(kind) => match kind {
                FailureKind::Unreachable => 10,
                FailureKind::AuthenticationRejected => 11,
                FailureKind::Protocol => 12,
                FailureKind::LocalClose => 13,
                FailureKind::PeerClosed => 14,
                FailureKind::FramingOverflow => 15,
            },
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Idle
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed(kind) => write!(f, "failed ({:?})", kind),
        }
    }
}

/// Emitted once per actual state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// The link that changed
    pub source: Id,
    /// The previous state
    pub old_state: ConnectionState,
    /// The new state
    pub new_state: ConnectionState,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_status_codes_are_distinct() {
        let states = [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Failed(FailureKind::Unreachable),
            ConnectionState::Failed(FailureKind::AuthenticationRejected),
            ConnectionState::Failed(FailureKind::Protocol),
            ConnectionState::Failed(FailureKind::LocalClose),
            ConnectionState::Failed(FailureKind::PeerClosed),
            ConnectionState::Failed(FailureKind::FramingOverflow),
        ];

        let codes: HashSet<u16> = states.iter().map(|s| s.status_code()).collect();
        assert_eq!(codes.len(), states.len());
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Failed(FailureKind::Protocol).is_failed());
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(
            ConnectionState::Failed(FailureKind::PeerClosed).to_string(),
            "failed (PeerClosed)"
        );
    }
}
