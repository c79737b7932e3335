//! Persistent authenticated stream connection
//!
//! One WebSocket to the Lyo stream endpoint, signed through the shared
//! `SessionManager`. A supervisor task per `connect` multiplexes inbound
//! frames, heartbeat pings and cancellation; lost transports are reopened
//! with capped exponential backoff, and a connection that stops answering
//! pings, or cannot be reopened, is handed to the fallback callback so the
//! caller can switch to polling.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod state;

pub use backoff::BackoffPolicy;
pub use config::StreamConfig;
pub use connection::{Frame, StreamConnection, StreamEvent};
pub use envelope::{Envelope, EventKind};
pub use error::{Error, Result};
pub use state::{ConnectionState, HeartbeatState};
