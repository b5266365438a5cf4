/*!
 * Error type for link operations.
 */
use thiserror::Error;

use linkflow_core::error::Error as CoreError;

use crate::state::FailureKind;

/// Error type for link operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// The link is not connected
    #[error("Link not connected")]
    NotConnected,

    /// The remote host could not be reached
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// The device rejected our credentials
    #[error("Authentication rejected: {0}")]
    Rejected(String),

    /// The device spoke something we could not follow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The link was closed on our side
    #[error("Link closed locally: {0}")]
    LocalClose(String),

    /// The device closed the link
    #[error("Link closed by peer")]
    PeerClosed,

    /// The receive buffer grew past its limit without a complete frame
    #[error("Receive buffer overflow: {buffered} bytes without a frame (limit {limit})")]
    FramingOverflow {
        /// Bytes held when the limit was hit
        buffered: usize,
        /// Configured limit
        limit: usize,
    },

    /// A command was submitted while the link was down and the policy rejects it
    #[error("Command rejected: link is not connected")]
    SendWhileDisconnected,

    /// The outbound queue is full
    #[error("Command queue full ({0} pending)")]
    QueueFull(usize),

    /// The connection string could not be parsed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// No transport is registered for the scheme
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Classify the error into the failure a supervisor reports.
    ///
    /// Connect timeouts count as an unreachable host. Errors that never come
    /// out of a transport (queue and configuration errors) are `None`.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            LinkError::Unreachable(_) | LinkError::Timeout(_) => Some(FailureKind::Unreachable),
            LinkError::Core(CoreError::Timeout(_)) => Some(FailureKind::Unreachable),
            LinkError::Rejected(_) => Some(FailureKind::AuthenticationRejected),
            LinkError::Protocol(_) => Some(FailureKind::Protocol),
            LinkError::LocalClose(_) | LinkError::NotConnected => Some(FailureKind::LocalClose),
            LinkError::PeerClosed => Some(FailureKind::PeerClosed),
            LinkError::FramingOverflow { .. } => Some(FailureKind::FramingOverflow),
            LinkError::Io(e) => Some(classify_io(e)),
            _ => None,
        }
    }

    /// Map a connect-time I/O error onto the link taxonomy
    pub fn from_connect_io(err: std::io::Error) -> Self {
        match classify_io(&err) {
            FailureKind::Unreachable => LinkError::Unreachable(err.to_string()),
            FailureKind::AuthenticationRejected => LinkError::Rejected(err.to_string()),
            _ => LinkError::Io(err),
        }
    }
}

/// Map a failed connect to `peer`. Refusals of access become `Rejected`;
/// everything else, name resolution included, is an unreachable host.
pub(crate) fn connect_failed(peer: &str, err: std::io::Error) -> LinkError {
    match classify_io(&err) {
        FailureKind::AuthenticationRejected => LinkError::Rejected(format!("{}: {}", peer, err)),
        _ => LinkError::Unreachable(format!("{}: {}", peer, err)),
    }
}

fn classify_io(err: &std::io::Error) -> FailureKind {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::TimedOut
        | ErrorKind::AddrNotAvailable
        | ErrorKind::NotFound => FailureKind::Unreachable,
        ErrorKind::PermissionDenied => FailureKind::AuthenticationRejected,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            FailureKind::PeerClosed
        }
        ErrorKind::InvalidData => FailureKind::Protocol,
        _ => FailureKind::LocalClose,
    }
}
