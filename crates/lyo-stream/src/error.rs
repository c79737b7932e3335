//! Stream connection errors
//!
//! Liveness failures are not errors: they surface through the fallback
//! callback. These cover the calls a caller makes directly.

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream is not connected")]
    NotConnected,

    /// `disconnect` ran while `connect` was still opening the transport
    #[error("stream closed before the connection was established")]
    Closed,

    #[error("invalid stream url: {0}")]
    InvalidUrl(String),

    #[error("stream connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    /// The server answered the upgrade request with a non-101 status
    #[error("stream upgrade rejected with status {0}")]
    Rejected(u16),

    /// Refreshing credentials after a rejected upgrade failed
    #[error("stream upgrade unauthorized: {0}")]
    Unauthorized(#[from] lyo_auth::Error),

    #[error("failed to send frame: {0}")]
    Send(#[source] tungstenite::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    /// Classify a failed handshake, pulling out the HTTP status when the
    /// server rejected the upgrade.
    pub(crate) fn from_handshake(err: tungstenite::Error) -> Self {
        match upgrade_status(&err) {
            Some(status) => Error::Rejected(status),
            None => Error::Connect(err),
        }
    }
}

pub(crate) fn upgrade_status(err: &tungstenite::Error) -> Option<u16> {
    match err {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
