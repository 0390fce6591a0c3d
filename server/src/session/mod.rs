//! Session management for connected clients
//!
//! This module handles:
//! - Framed reads from each client connection
//! - Tracking authenticated sessions by session id
//! - Idle detection for clients that stopped sending

mod connection;
mod manager;

pub use connection::{ClientSession, SessionHandle};
pub use manager::SessionManager;
