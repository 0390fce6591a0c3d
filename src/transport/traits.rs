//! Transport trait abstraction for pluggable duplex channels

use crate::auth::Credential;
use anyhow::Result;
use async_trait::async_trait;
use tether_shared::Envelope;

/// An open duplex channel carrying envelopes
#[async_trait]
pub trait TransportStream: Send + 'static {
    /// Write one envelope to the peer
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Read the next envelope; `Ok(None)` once the peer has closed
    ///
    /// Must be cancel-safe: it is polled inside `select!` alongside writes.
    async fn recv(&mut self) -> Result<Option<Envelope>>;

    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// Factory for creating transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// The stream type this connector produces
    type Stream: TransportStream;

    /// Open a channel, attaching the credential to its handshake
    async fn connect(&self, credential: &Credential) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
