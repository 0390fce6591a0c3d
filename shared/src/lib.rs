//! Tether Shared Protocol Types
//!
//! This crate provides the wire envelope, the frame codec and the connection
//! state machine shared by Tether clients and the reference server.

pub mod codec;
pub mod envelope;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use envelope::{
    msg_type, AuthErrorCode, AuthErrorInfo, Envelope, EnvelopeError, Inbound, SessionCreated,
};
pub use state_machine::{ConnectionState, ConnectionStateMachine, ConnectionTrigger, TransitionResult};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default timing parameters for the connection lifecycle
pub mod timing {
    /// Time allowed for the transport to open
    pub const OPEN_TIMEOUT_MS: u64 = 30_000;

    /// Time allowed between transport open and `session_created`
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

    /// Interval between liveness probes while connected
    pub const HEARTBEAT_INTERVAL_MS: u64 = 25_000;

    /// Window for a liveness reply before the link is considered dead
    pub const PONG_TIMEOUT_MS: u64 = 60_000;

    /// Reconnect backoff ladder
    pub const BACKOFF_LADDER_MS: [u64; 6] = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000];

    /// Outbound messages buffered while not connected
    pub const QUEUE_CAPACITY: usize = 100;

    /// Time allowed for exchanging a refresh token
    pub const REFRESH_TIMEOUT_MS: u64 = 10_000;
}
