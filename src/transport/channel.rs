//! In-memory transport
//!
//! Each successful `connect()` hands the far end of the channel to a
//! [`ChannelAcceptor`] as a [`ChannelPeer`], which plays the backend.
//! Opens can be refused or stalled to reproduce network failures.

use crate::auth::Credential;
use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_shared::Envelope;
use tokio::sync::mpsc;

struct Shared {
    accept_tx: mpsc::UnboundedSender<ChannelPeer>,
    attempts: AtomicUsize,
    refusals: AtomicUsize,
    stalls: AtomicUsize,
}

/// Connector half of the in-memory transport
#[derive(Clone)]
pub struct ChannelConnector {
    shared: Arc<Shared>,
}

impl ChannelConnector {
    /// Create a connector and the acceptor that receives its peers
    pub fn new() -> (Self, ChannelAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                accept_tx,
                attempts: AtomicUsize::new(0),
                refusals: AtomicUsize::new(0),
                stalls: AtomicUsize::new(0),
            }),
        };
        (connector, ChannelAcceptor { accept_rx })
    }

    /// Fail the next `n` opens immediately
    pub fn refuse_next(&self, n: usize) {
        self.shared.refusals.store(n, Ordering::SeqCst);
    }

    /// Never complete the next `n` opens
    pub fn stall_next(&self, n: usize) {
        self.shared.stalls.store(n, Ordering::SeqCst);
    }

    /// Number of opens attempted so far
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TransportConnector for ChannelConnector {
    type Stream = ChannelStream;

    async fn connect(&self, credential: &Credential) -> Result<Self::Stream> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if Self::take_one(&self.shared.refusals) {
            bail!("connection refused");
        }
        if Self::take_one(&self.shared.stalls) {
            std::future::pending::<()>().await;
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();

        let peer = ChannelPeer {
            credential: credential.clone(),
            to_client,
            from_client,
        };
        self.shared
            .accept_tx
            .send(peer)
            .map_err(|_| anyhow!("acceptor dropped"))?;

        Ok(ChannelStream { to_peer, from_peer })
    }

    fn name(&self) -> &'static str {
        "Channel"
    }
}

/// Receives the backend side of every opened channel
pub struct ChannelAcceptor {
    accept_rx: mpsc::UnboundedReceiver<ChannelPeer>,
}

impl ChannelAcceptor {
    /// Wait for the next opened channel
    pub async fn accept(&mut self) -> Option<ChannelPeer> {
        self.accept_rx.recv().await
    }

    /// Next opened channel, if one is already waiting
    pub fn try_accept(&mut self) -> Option<ChannelPeer> {
        self.accept_rx.try_recv().ok()
    }
}

/// Backend side of one channel
pub struct ChannelPeer {
    /// Credential the client attached to this open
    pub credential: Credential,
    to_client: mpsc::UnboundedSender<Envelope>,
    from_client: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelPeer {
    /// Deliver an envelope to the client; false once the client side is gone
    pub fn send(&self, envelope: Envelope) -> bool {
        self.to_client.send(envelope).is_ok()
    }

    /// Next envelope written by the client; `None` once it closed the channel
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.from_client.recv().await
    }

    /// Next envelope written by the client, skipping heartbeat probes
    pub async fn recv_skipping_pings(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.recv().await?;
            if envelope.msg_type != tether_shared::msg_type::PING {
                return Some(envelope);
            }
        }
    }

    /// Whether the client has closed its end
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }
}

/// Client side of one channel
pub struct ChannelStream {
    to_peer: mpsc::UnboundedSender<Envelope>,
    from_peer: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait]
impl TransportStream for ChannelStream {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.to_peer
            .send(envelope.clone())
            .map_err(|_| anyhow!("peer closed"))
    }

    async fn recv(&mut self) -> Result<Option<Envelope>> {
        Ok(self.from_peer.recv().await)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.from_peer.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_roundtrip() {
        let (connector, mut acceptor) = ChannelConnector::new();
        let mut stream = connector.connect(&Credential::guest("guest_1")).await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();

        assert_eq!(peer.credential, Credential::guest("guest_1"));

        stream.send(&Envelope::ping()).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().msg_type, "ping");

        assert!(peer.send(Envelope::pong()));
        assert_eq!(stream.recv().await.unwrap().unwrap().msg_type, "pong");

        drop(peer);
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refusals_are_counted() {
        let (connector, mut acceptor) = ChannelConnector::new();
        connector.refuse_next(2);

        let credential = Credential::primary("jwt");
        assert!(connector.connect(&credential).await.is_err());
        assert!(connector.connect(&credential).await.is_err());
        assert!(connector.connect(&credential).await.is_ok());

        assert_eq!(connector.attempts(), 3);
        assert!(acceptor.try_accept().is_some());
        assert!(acceptor.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_peer() {
        let (connector, mut acceptor) = ChannelConnector::new();
        let stream = connector.connect(&Credential::primary("jwt")).await.unwrap();
        let peer = acceptor.accept().await.unwrap();

        assert!(!peer.is_closed());
        drop(stream);
        assert!(peer.is_closed());
    }
}
