//! Endpoint layout and credential identifiers
//!
//! The API is versioned under `/v1`; the refresh endpoint and the streaming
//! endpoint hang off the same base. Credential keys are fixed so a restart
//! finds the tokens written by the previous process.

/// Path prefix for every versioned API call
pub const API_VERSION: &str = "v1";

/// Refresh endpoint, relative to the versioned base
pub const REFRESH_PATH: &str = "auth/refresh";

/// Streaming endpoint, relative to the WebSocket base
pub const STREAM_PATH: &str = "ws";

/// Store identifier for the access token
pub const ACCESS_TOKEN_KEY: &str = "lyo_access_token";

/// Store identifier for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "lyo_refresh_token";

/// Join a base URL and a relative API path as `{base}/v1/{path}`.
///
/// Tolerates a trailing slash on `base` and a leading slash on `path`.
pub fn api_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        API_VERSION,
        path.trim_start_matches('/')
    )
}

/// Derive the streaming URL (`ws(s)://host/ws`) from an HTTP(S) base.
pub fn stream_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/{STREAM_PATH}")
}
