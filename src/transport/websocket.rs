//! WebSocket transport carrying JSON envelopes as text frames

use crate::auth::Credential;
use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tether_shared::Envelope;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// WebSocket stream wrapper implementing TransportStream
pub struct WsTransportStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransportStream {
    fn parse(raw: &[u8]) -> Option<Envelope> {
        match serde_json::from_slice(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("Skipping undecodable frame: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl TransportStream for WsTransportStream {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope)?;
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Envelope>> {
        while let Some(message) = self.inner.next().await {
            let envelope = match message? {
                Message::Text(text) => Self::parse(text.as_bytes()),
                Message::Binary(bytes) => Self::parse(&bytes),
                Message::Close(frame) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                // Protocol-level ping/pong is answered by tungstenite
                _ => None,
            };

            if let Some(envelope) = envelope {
                return Ok(Some(envelope));
            }
        }

        Ok(None)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.close(None).await?;
        Ok(())
    }
}

/// WebSocket connector; the credential travels as a bearer header
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    type Stream = WsTransportStream;

    async fn connect(&self, credential: &Credential) -> Result<Self::Stream> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.value))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (inner, response) = connect_async(request).await?;
        debug!("WebSocket upgrade complete: status={}", response.status());

        Ok(WsTransportStream { inner })
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}
