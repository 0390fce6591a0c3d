//! Tether client
//!
//! A resilient connection manager for a persistent, bidirectional real-time
//! channel: transport open, authentication handshake, heartbeats, bounded
//! backoff reconnection, offline buffering and typed event dispatch.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

pub use auth::{AuthNegotiator, Credential, CredentialKind, CredentialStore, GuestIdentity};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, OutboundMessage, Session, Subscription};
pub use error::{ConnectError, ConnectionFailure};
pub use tether_shared::{ConnectionState, Envelope};
