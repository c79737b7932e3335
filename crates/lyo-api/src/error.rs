//! Request pipeline error taxonomy

use common::ProblemDetails;

/// What the caller should offer the user after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Credentials are gone or rejected; prompt for sign-in
    Login,
    /// Transient failure; offer a retry affordance
    Retry,
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request body could not be serialized; nothing was sent
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// Caller-supplied header was not a valid name or value
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// DNS, connect, timeout or reset
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    /// 2xx response whose body did not match the expected shape
    #[error("failed to decode response (status {status}): {message}")]
    Decode { status: u16, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(ProblemDetails),

    #[error("client error: {0}")]
    Client(ProblemDetails),

    #[error("server error: {0}")]
    Server(ProblemDetails),

    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
}

impl Error {
    /// Problem document attached to this error, server-sent or synthesized.
    pub fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            Error::Unauthorized(problem) | Error::Client(problem) | Error::Server(problem) => {
                Some(problem)
            }
            _ => None,
        }
    }

    /// HTTP status behind this error, when a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Decode { status, .. } => Some(*status),
            Error::UnexpectedStatus(status) => Some(*status),
            _ => self.problem().map(|problem| problem.status),
        }
    }

    pub fn user_action(&self) -> UserAction {
        match self {
            Error::Unauthorized(_) => UserAction::Login,
            Error::Client(problem) if problem.is_auth_error() => UserAction::Login,
            Error::Client(problem) if problem.is_rate_limit_error() => UserAction::Retry,
            Error::Network(_) | Error::Server(_) => UserAction::Retry,
            _ => UserAction::None,
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
