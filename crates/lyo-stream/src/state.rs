//! Connection lifecycle and heartbeat bookkeeping

use std::fmt;
use std::time::Instant;

/// `Disconnected → Connecting → Connected → {Reconnecting | Failed} → Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transport lost; backoff reconnection in progress
    Reconnecting,
    /// Heartbeat threshold reached or reconnect attempts exhausted
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    /// A supervisor task owns the connection in these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Send a ping; `missed` is true when the previous one went unanswered
    Ping { missed: bool },
    /// Missed-pong threshold reached; stop the connection
    Expired,
}

/// Ping/pong accounting for one live transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// Consecutive pings that went unanswered for a full interval
    pub missed_count: u32,
    pub last_ping_at: Option<Instant>,
    pub awaiting_pong: bool,
}

impl HeartbeatState {
    pub(crate) fn on_tick(&mut self, threshold: u32, now: Instant) -> Tick {
        let missed = self.awaiting_pong;
        if missed {
            self.missed_count += 1;
        }
        if self.missed_count >= threshold {
            return Tick::Expired;
        }
        self.awaiting_pong = true;
        self.last_ping_at = Some(now);
        Tick::Ping { missed }
    }

    /// Any inbound frame, pong or not, proves the peer is alive.
    pub(crate) fn record_inbound(&mut self) {
        self.missed_count = 0;
        self.awaiting_pong = false;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
