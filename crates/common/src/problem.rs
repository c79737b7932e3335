//! Problem Details (RFC 7807) error bodies
//!
//! The API answers failures with `{type?, title, status, detail?, instance?}`
//! plus optional extension members. The session crates decode these to
//! classify failures and surface the server's human-readable detail.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured error body returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// URI reference identifying the problem type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Extension members beyond the five standard fields
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(title: impl Into<String>, status: u16, detail: Option<String>) -> Self {
        Self {
            problem_type: None,
            title: title.into(),
            status,
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }

    /// Decode a response body, returning `None` when it is not a problem document.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// Generic problem for a status code that came without a structured body.
    pub fn from_status(status: u16) -> Self {
        let detail = if (400..500).contains(&status) {
            format!("Client error: {status}")
        } else if (500..600).contains(&status) {
            format!("Server error: {status}")
        } else {
            format!("Unexpected status code: {status}")
        };
        Self::new(reason_phrase(status), status, Some(detail))
    }

    pub fn invalid_request(detail: Option<String>) -> Self {
        Self::new(
            "Invalid Request",
            400,
            detail.or_else(|| {
                Some("The request is malformed or missing required parameters.".into())
            }),
        )
    }

    pub fn unauthorized(detail: Option<String>) -> Self {
        Self::new(
            "Unauthorized",
            401,
            detail.or_else(|| {
                Some("Authentication is required to access this resource.".into())
            }),
        )
    }

    pub fn forbidden(detail: Option<String>) -> Self {
        Self::new(
            "Forbidden",
            403,
            detail.or_else(|| {
                Some("You don't have permission to access this resource.".into())
            }),
        )
    }

    pub fn not_found(detail: Option<String>) -> Self {
        Self::new(
            "Not Found",
            404,
            detail.or_else(|| Some("The requested resource was not found.".into())),
        )
    }

    pub fn rate_limited(detail: Option<String>) -> Self {
        Self::new(
            "Too Many Requests",
            429,
            detail.or_else(|| Some("Rate limit exceeded. Please try again later.".into())),
        )
    }

    pub fn internal_server_error(detail: Option<String>) -> Self {
        Self::new(
            "Internal Server Error",
            500,
            detail.or_else(|| Some("An unexpected error occurred on the server.".into())),
        )
    }

    pub fn service_unavailable(detail: Option<String>) -> Self {
        Self::new(
            "Service Unavailable",
            503,
            detail.or_else(|| Some("The service is temporarily unavailable.".into())),
        )
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    pub fn is_auth_error(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_validation_error(&self) -> bool {
        self.status == 400 || self.status == 422
    }

    pub fn is_rate_limit_error(&self) -> bool {
        self.status == 429
    }

    /// Text suitable for an error banner: the detail when present, else the title.
    pub fn message(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.title)
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        if self.is_client_error() {
            Some("Please check your request and try again.")
        } else if self.is_server_error() {
            Some("This appears to be a server issue. Please try again later.")
        } else {
            None
        }
    }

    /// Look up an extension member.
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }
}

impl fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.title, self.status, self.message())
    }
}

impl std::error::Error for ProblemDetails {}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        400..=499 => "Client Error",
        500..=599 => "Server Error",
        _ => "Unexpected Status",
    }
}
