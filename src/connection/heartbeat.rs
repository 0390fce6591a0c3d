//! Liveness probing for a confirmed session
//!
//! The monitor owns two timers: the probe ticker and the pong deadline.
//! Both exist only between `start()` and `stop()`, which the manager calls
//! on entering and leaving CONNECTED.

use super::timer::Timer;
use std::time::Duration;
use tether_shared::Envelope;
use tokio::time::Instant;
use tracing::debug;

/// Most recent probe/reply measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSample {
    pub sent_at: Instant,
    pub rtt: Duration,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    pong_timeout: Duration,
    ticker: Timer,
    pong_deadline: Timer,
    last_ping: Option<Instant>,
    awaiting_pong: bool,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            interval,
            pong_timeout,
            ticker: Timer::new(),
            pong_deadline: Timer::new(),
            last_ping: None,
            awaiting_pong: false,
        }
    }

    /// Begin probing; the first probe is due immediately
    pub fn start(&mut self) {
        self.ticker.arm(Duration::ZERO);
        self.pong_deadline.cancel();
        self.last_ping = None;
        self.awaiting_pong = false;
    }

    /// Cancel the ticker and any pending pong deadline
    pub fn stop(&mut self) {
        self.ticker.cancel();
        self.pong_deadline.cancel();
        self.awaiting_pong = false;
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_armed()
    }

    /// Record a probe and return it for transmission
    ///
    /// The pong deadline is armed by the first unanswered probe only.
    pub fn on_tick(&mut self) -> Envelope {
        let now = Instant::now();
        self.last_ping = Some(now);
        if !self.awaiting_pong {
            self.awaiting_pong = true;
            self.pong_deadline.arm(self.pong_timeout);
        }
        self.ticker.arm(self.interval);
        Envelope::ping()
    }

    /// Accept a reply and measure it against the latest probe
    ///
    /// `None` if no probe is outstanding.
    pub fn on_pong(&mut self) -> Option<HeartbeatSample> {
        if !self.awaiting_pong {
            debug!("Ignoring pong with no outstanding probe");
            return None;
        }
        let sent_at = self.last_ping?;

        let rtt = sent_at.elapsed();
        self.awaiting_pong = false;
        self.pong_deadline.cancel();
        Some(HeartbeatSample { sent_at, rtt })
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// Resolves when the next probe is due
    pub async fn probe_due(&self) {
        self.ticker.fired().await
    }

    /// Resolves when an outstanding probe went unanswered for the pong window
    pub async fn pong_timed_out(&self) {
        self.pong_deadline.fired().await
    }
}
