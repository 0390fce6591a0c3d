//! Individual client session handling

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_shared::codec::{self, FrameDecoder};
use tether_shared::Envelope;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Handle to send messages to a specific client
#[derive(Clone)]
pub struct SessionHandle {
    /// Empty until the handshake succeeds
    pub session_id: String,
    pub user_id: String,
    pub is_guest: bool,
    pub addr: SocketAddr,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    pub connected_at: Instant,
    last_seen: Arc<Mutex<Instant>>,
}

impl SessionHandle {
    /// Send an envelope to this client
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let encoded = codec::encode(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Close the write side; the client sees end-of-stream
    pub async fn close(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    /// Record inbound traffic
    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    /// Time since the client last sent anything
    pub async fn idle_for(&self) -> Duration {
        self.last_seen.lock().await.elapsed()
    }

    /// Whether the client has sent anything within `timeout`
    pub async fn is_alive(&self, timeout: Duration) -> bool {
        self.idle_for().await <= timeout
    }
}

/// Active client session
pub struct ClientSession {
    pub handle: SessionHandle,
    reader: ReadHalf<TcpStream>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl ClientSession {
    /// Create a new session from an accepted TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let now = Instant::now();

        let handle = SessionHandle {
            session_id: String::new(),
            user_id: String::new(),
            is_guest: false,
            addr,
            writer: Arc::new(Mutex::new(writer)),
            connected_at: now,
            last_seen: Arc::new(Mutex::new(now)),
        };

        Self {
            handle,
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending messages
    pub fn get_handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next envelope from this session
    /// Returns None if the connection is closed
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            // First try to decode from existing buffer
            match self.decoder.decode_next() {
                Ok(Some(envelope)) => {
                    self.handle.touch().await;
                    return Some(envelope);
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(addr = %self.handle.addr, "Skipping undecodable frame: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!(addr = %self.handle.addr, "Decode error: {}", e);
                    return None;
                }
            }

            // Read more data
            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => {
                    self.decoder.extend(&self.read_buf[..n]);
                }
                Err(e) => {
                    warn!(addr = %self.handle.addr, "Read error: {}", e);
                    return None;
                }
            }
        }
    }

    /// Get the remote address
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }
}
