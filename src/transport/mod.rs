//! Transports the connection manager can drive
//!
//! - Framed TCP (length-prefixed JSON, credential sent as the first frame)
//! - WebSocket (JSON text frames, credential as a bearer header)
//! - In-memory channel (tests and embedding)

pub mod channel;
pub mod tcp;
pub mod traits;
pub mod websocket;

pub use channel::{ChannelAcceptor, ChannelConnector, ChannelPeer, ChannelStream};
pub use tcp::{TcpConnector, TcpTransportStream};
pub use traits::{TransportConnector, TransportStream};
pub use websocket::{WsConnector, WsTransportStream};
