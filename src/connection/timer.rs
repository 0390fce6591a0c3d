//! Cancellable one-shot deadline owned by the connection actor

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A deadline that is either armed or idle
///
/// `fired()` pends forever while idle, so an idle timer can sit in a
/// `select!` without a guard. Cancelling only clears the deadline; nothing
/// is left in flight to deliver a late firing.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer to fire `after` from now
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once the armed deadline passes
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
