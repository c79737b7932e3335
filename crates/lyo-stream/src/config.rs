//! Stream connection settings

use std::time::Duration;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before the connection is given up.
    /// Detection latency is bounded by `heartbeat_interval * (threshold + 1)`.
    pub missed_pong_threshold: u32,
    pub backoff: BackoffPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            missed_pong_threshold: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}
