//! Connection management for a persistent, authenticated duplex channel
//!
//! This module handles:
//! - The connection lifecycle (open, handshake, confirmed session)
//! - Automatic reconnection with a fixed backoff ladder
//! - Heartbeat probing and latency measurement
//! - Outbound buffering while offline and inbound event dispatch

mod driver;
mod event_bus;
mod heartbeat;
mod manager;
mod queue;
mod reconnect;
mod timer;

pub use event_bus::{EventBus, EventHandler, StateHandler, Subscription};
pub use heartbeat::{HeartbeatMonitor, HeartbeatSample};
pub use manager::{ConnectionManager, Session};
pub use queue::{MessageQueue, OutboundMessage, QueuedMessage};
pub use reconnect::ReconnectScheduler;
pub use timer::Timer;
