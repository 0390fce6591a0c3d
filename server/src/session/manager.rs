//! Session manager for tracking all authenticated clients

use super::connection::SessionHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Manages all active client sessions
#[derive(Clone, Default)]
pub struct SessionManager {
    /// Map of session_id -> session handle
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated session
    pub async fn register(&self, handle: SessionHandle) {
        if handle.session_id.is_empty() {
            warn!(addr = %handle.addr, "Refusing to register a session without an id");
            return;
        }

        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.session_id.clone(), handle);
    }

    /// Unregister a session
    pub async fn unregister(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(session_id)
    }

    /// Sessions that have been silent for longer than `idle_timeout`
    pub async fn check_dead_sessions(&self, idle_timeout: Duration) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut dead = Vec::new();
        for (session_id, handle) in sessions.iter() {
            if !handle.is_alive(idle_timeout).await {
                dead.push(session_id.clone());
            }
        }
        dead
    }

    /// Remove idle sessions and return their handles so they can be closed
    pub async fn remove_dead_sessions(&self, idle_timeout: Duration) -> Vec<SessionHandle> {
        let dead = self.check_dead_sessions(idle_timeout).await;
        if dead.is_empty() {
            return Vec::new();
        }

        let mut sessions = self.sessions.write().await;
        dead.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    /// Get the number of connected sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
