//! Backoff scheduling between reconnection attempts

use super::timer::Timer;
use crate::config::default_backoff_ladder;
use std::time::Duration;

/// Picks the delay for each consecutive retry and owns the single backoff timer
#[derive(Debug)]
pub struct ReconnectScheduler {
    ladder: Vec<Duration>,
    attempts: u32,
    timer: Timer,
}

impl ReconnectScheduler {
    /// An empty ladder falls back to the default 1/2/4/8/16/30 s
    pub fn new(ladder: Vec<Duration>) -> Self {
        let ladder = if ladder.is_empty() {
            default_backoff_ladder()
        } else {
            ladder
        };
        Self {
            ladder,
            attempts: 0,
            timer: Timer::new(),
        }
    }

    /// Delay for the `attempt`-th consecutive retry (0-indexed); the last rung repeats
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.ladder.len() - 1);
        self.ladder[index]
    }

    /// Arm the timer for the next retry and return the chosen delay
    ///
    /// Any previously armed timer is replaced.
    pub fn schedule(&mut self) -> Duration {
        let delay = self.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.timer.arm(delay);
        delay
    }

    /// Forget the consecutive-failure count after a confirmed session
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.timer.cancel();
    }

    pub fn cancel(&mut self) {
        self.timer.cancel();
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_armed()
    }

    /// Retries scheduled since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Resolves when the armed backoff elapses
    pub async fn due(&self) {
        self.timer.fired().await
    }
}
