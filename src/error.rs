//! Error types for the connection lifecycle

use tether_shared::{AuthErrorCode, ConnectionTrigger};
use thiserror::Error;

/// Why a connection attempt or a live connection failed
///
/// Every variant is retryable: the manager funnels all of them into the
/// ERROR/RECONNECTING path until the application disconnects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionFailure {
    #[error("transport failed to open: {reason}")]
    TransportOpen { reason: String },

    #[error("session confirmation not received in time")]
    HandshakeTimeout,

    #[error("authentication failed ({code}): {message}")]
    AuthFailure { code: AuthErrorCode, message: String },

    #[error("no heartbeat reply within the pong window")]
    HeartbeatTimeout,

    #[error("transport closed: {reason}")]
    TransportClosed { reason: String },
}

impl ConnectionFailure {
    /// Short name for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionFailure::TransportOpen { .. } => "transport_open",
            ConnectionFailure::HandshakeTimeout => "handshake_timeout",
            ConnectionFailure::AuthFailure { .. } => "auth_failure",
            ConnectionFailure::HeartbeatTimeout => "heartbeat_timeout",
            ConnectionFailure::TransportClosed { .. } => "transport_closed",
        }
    }

    /// State machine trigger for this failure while the session is not yet confirmed
    pub(crate) fn trigger(&self) -> ConnectionTrigger {
        match self {
            ConnectionFailure::TransportOpen { .. } => ConnectionTrigger::OpenFailed,
            ConnectionFailure::HandshakeTimeout => ConnectionTrigger::HandshakeTimedOut,
            ConnectionFailure::AuthFailure { .. } => ConnectionTrigger::AuthRejected,
            ConnectionFailure::HeartbeatTimeout | ConnectionFailure::TransportClosed { .. } => {
                ConnectionTrigger::TransportFailed
            }
        }
    }
}

/// Outcome of a `connect()` call that did not reach CONNECTED
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error(transparent)]
    Failed(#[from] ConnectionFailure),

    #[error("connect cancelled by disconnect()")]
    Cancelled,

    #[error("connect superseded by a newer connect()")]
    Superseded,

    #[error("connection manager has shut down")]
    Shutdown,
}
