//! Connection State Machine
//!
//! Defines the connection states and the only edges allowed between them.
//! The client orchestrator feeds triggers in; every accepted edge is reported
//! back so it can be broadcast to subscribers.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTrigger {
    /// Application called `connect()`
    ConnectRequested,
    /// Transport reported open
    TransportOpened,
    /// Transport failed to open or timed out opening
    OpenFailed,
    /// `session_created` received within the handshake window
    SessionConfirmed,
    /// Backend rejected the credential
    AuthRejected,
    /// No `session_created` within the handshake window
    HandshakeTimedOut,
    /// Transport closed before the session was confirmed
    TransportFailed,
    /// Heartbeat timeout or transport close while connected
    ConnectionLost,
    /// Backoff timer armed
    RetryScheduled,
    /// Backoff timer fired
    BackoffElapsed,
    /// Application called `disconnect()`
    DisconnectRequested,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Transition was valid but the state is the same
    Unchanged(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        trigger: ConnectionTrigger,
    },
}

/// Holds the authoritative connection state
#[derive(Debug)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Disconnected,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Process a trigger and return the transition result
    pub fn process(&mut self, trigger: ConnectionTrigger) -> TransitionResult {
        let from = self.current_state;

        match next_state(from, trigger) {
            Some(to) if to == from => TransitionResult::Unchanged(from),
            Some(to) => {
                self.current_state = to;
                TransitionResult::Changed { from, to }
            }
            None => TransitionResult::Invalid { from, trigger },
        }
    }
}

/// Get the next state for a given trigger, if the transition is valid
fn next_state(from: ConnectionState, trigger: ConnectionTrigger) -> Option<ConnectionState> {
    use ConnectionState::*;
    use ConnectionTrigger::*;

    match (from, trigger) {
        // Manual disconnect wins from anywhere
        (_, DisconnectRequested) => Some(Disconnected),

        // connect() is a no-op once connected, otherwise (re)starts an attempt
        (Connected, ConnectRequested) => Some(Connected),
        (_, ConnectRequested) => Some(Connecting),

        (Connecting, TransportOpened) => Some(Authenticating),
        (Connecting, OpenFailed) => Some(Error),

        (Authenticating, SessionConfirmed) => Some(Connected),
        (Authenticating, AuthRejected) => Some(Error),
        (Authenticating, HandshakeTimedOut) => Some(Error),
        (Authenticating, TransportFailed) => Some(Error),

        (Connected, ConnectionLost) => Some(Disconnected),

        (Error | Disconnected, RetryScheduled) => Some(Reconnecting),
        (Reconnecting, BackoffElapsed) => Some(Connecting),

        _ => None,
    }
}

/// Check if a transition from one state to another is valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Manual disconnect and a fresh connect() are reachable from anywhere
        (_, Disconnected) => true,
        (Connected, Connecting) => false,
        (_, Connecting) => true,

        (Connecting, Authenticating) => true,
        (Connecting, Error) => true,
        (Authenticating, Connected) => true,
        (Authenticating, Error) => true,
        (Error | Disconnected, Reconnecting) => true,

        _ => false,
    }
}
