//! Client configuration

use std::time::Duration;
use tether_shared::timing;

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed for the transport to open
    pub open_timeout: Duration,
    /// Time allowed between transport open and session confirmation
    pub handshake_timeout: Duration,
    /// Interval between liveness probes while connected
    pub heartbeat_interval: Duration,
    /// Window for a liveness reply before the transport is force-closed
    pub pong_timeout: Duration,
    /// Reconnect delays, indexed by consecutive attempt (last entry repeats)
    pub backoff_ladder: Vec<Duration>,
    /// Outbound messages buffered while not connected
    pub queue_capacity: usize,
    /// Time allowed for exchanging a refresh token
    pub refresh_timeout: Duration,
    /// Frames buffered between the manager and a live transport
    pub outbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_millis(timing::OPEN_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
            pong_timeout: Duration::from_millis(timing::PONG_TIMEOUT_MS),
            backoff_ladder: default_backoff_ladder(),
            queue_capacity: timing::QUEUE_CAPACITY,
            refresh_timeout: Duration::from_millis(timing::REFRESH_TIMEOUT_MS),
            outbound_buffer: 256,
        }
    }
}

/// The standard 1/2/4/8/16/30 second ladder
pub fn default_backoff_ladder() -> Vec<Duration> {
    timing::BACKOFF_LADDER_MS
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.open_timeout, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
        assert_eq!(config.queue_capacity, 100);
        assert!(config.outbound_buffer > config.queue_capacity);
        assert_eq!(
            config.backoff_ladder,
            [1, 2, 4, 8, 16, 30].map(Duration::from_secs).to_vec()
        );
    }
}
