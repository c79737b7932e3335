//! Error types for session and credential operations

use common::ProblemDetails;

/// Errors from token refresh and credential storage.
///
/// `Clone` so a single refresh outcome can be handed to every caller that
/// waited on the same in-flight refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Refresh endpoint answered non-2xx without a problem document
    #[error("token refresh failed with status {status}")]
    RefreshFailed { status: u16 },

    /// Refresh endpoint answered with a problem document
    #[error("token refresh rejected: {0}")]
    Problem(ProblemDetails),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// The task driving the refresh was dropped before it finished
    #[error("token refresh abandoned before completion")]
    RefreshAbandoned,

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential sealing failed: {0}")]
    Crypto(String),
}

impl Error {
    /// Problem document carried by this error, if the server sent one.
    pub fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            Error::Problem(problem) => Some(problem),
            _ => None,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
