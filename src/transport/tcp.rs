//! TCP transport using length-prefixed JSON frames

use crate::auth::Credential;
use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use tether_shared::codec::{self, FrameDecoder};
use tether_shared::Envelope;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: stream,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let encoded = codec::encode(envelope)?;
        self.inner.write_all(&encoded).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            // First try to decode from existing buffer
            match self.decoder.decode_next() {
                Ok(Some(envelope)) => return Ok(Some(envelope)),
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping undecodable frame: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            // Read more data
            let n = self.inner.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// TCP connector for a framed Tether backend
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    type Stream = TcpTransportStream;

    async fn connect(&self, credential: &Credential) -> Result<Self::Stream> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        // Raw sockets have no handshake of their own; the credential goes first
        let mut transport = TcpTransportStream::new(stream);
        transport.send(&Envelope::auth(&credential.value)).await?;
        Ok(transport)
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_shared::msg_type;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_connector_name() {
        let connector = TcpConnector::new("127.0.0.1:8080");
        assert_eq!(connector.name(), "TCP");
    }

    #[tokio::test]
    async fn test_auth_frame_then_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut peer = TcpTransportStream::new(socket);

            let auth = peer.recv().await.unwrap().expect("auth frame");
            assert_eq!(auth.msg_type, msg_type::AUTH);
            assert_eq!(auth.auth_token(), Some("jwt-1"));

            let inbound = peer.recv().await.unwrap().expect("client frame");
            peer.send(&Envelope::new("echo", inbound.data)).await.unwrap();
            peer.shutdown().await.unwrap();
        });

        let connector = TcpConnector::new(addr.to_string());
        let mut stream = connector.connect(&Credential::primary("jwt-1")).await.unwrap();
        stream
            .send(&Envelope::new("chat", Some(json!({ "text": "hi" }))))
            .await
            .unwrap();

        let echo = stream.recv().await.unwrap().expect("echo frame");
        assert_eq!(echo.msg_type, "echo");
        assert_eq!(echo.data, Some(json!({ "text": "hi" })));

        // Peer shut down its side
        assert!(stream.recv().await.unwrap().is_none());
        server.await.unwrap();
    }
}
