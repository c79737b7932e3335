//! Token pair and the refresh endpoint exchange
//!
//! `POST {base}/v1/auth/refresh` with `{"refresh_token": ...}`. The response
//! always carries a new access token; the refresh token is rotated only when
//! the server sends one, and `expires_in` is an optional delta in seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{ProblemDetails, Secret};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// The in-memory credential pair.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta),
/// known only when the server reported `expires_in`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
    pub expires_at: Option<u64>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
            expires_at: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: Option<u64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Whether the access token expires within `threshold` from now.
    ///
    /// Pairs without a known expiry never report as expiring.
    pub fn expires_within(&self, threshold: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now_millis() + threshold.as_millis() as u64,
            None => false,
        }
    }
}

/// Body sent to the refresh endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Successful refresh endpoint response.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshGrant {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl RefreshGrant {
    /// Build the next pair, keeping `prior_refresh` when the server did not
    /// rotate the refresh token.
    pub fn into_pair(self, prior_refresh: &str) -> TokenPair {
        let rotated = self.refresh_token.filter(|token| !token.is_empty());
        if rotated.is_none() {
            debug!("refresh response did not rotate the refresh token, keeping prior");
        }
        let expires_at = self
            .expires_in
            .map(|secs| now_millis() + secs.saturating_mul(1000));
        TokenPair::new(
            self.access_token,
            rotated.unwrap_or_else(|| prior_refresh.to_string()),
        )
        .with_expires_at(expires_at)
    }
}

/// Exchange a refresh token for a new grant.
///
/// Non-2xx answers become `Problem` when the body is a problem document, else
/// `RefreshFailed` carrying the status. A 2xx body that does not decode, or
/// carries an empty access token, is rejected here so the caller never
/// commits an unusable pair.
pub async fn request_refresh(
    client: &reqwest::Client,
    url: &str,
    refresh_token: &str,
) -> Result<RefreshGrant> {
    let response = client
        .post(url)
        .json(&RefreshRequest { refresh_token })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Http(format!("reading refresh response: {e}")))?;

    if !status.is_success() {
        return Err(match ProblemDetails::from_body(&body) {
            Some(problem) => Error::Problem(problem),
            None => Error::RefreshFailed {
                status: status.as_u16(),
            },
        });
    }

    let grant: RefreshGrant = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidResponse(format!("decoding refresh response: {e}")))?;

    if grant.access_token.is_empty() {
        return Err(Error::Unauthorized(
            "refresh response carried an empty access token".into(),
        ));
    }

    Ok(grant)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_without_rotation_keeps_prior_refresh() {
        let grant: RefreshGrant = serde_json::from_str(r#"{"access_token":"a2"}"#).unwrap();
        let pair = grant.into_pair("r1");
        assert_eq!(pair.access.expose(), "a2");
        assert_eq!(pair.refresh.expose(), "r1");
        assert_eq!(pair.expires_at, None);
    }

    #[test]
    fn grant_with_rotation_replaces_refresh() {
        let grant: RefreshGrant =
            serde_json::from_str(r#"{"access_token":"a2","refresh_token":"r2","expires_in":3600}"#)
                .unwrap();
        let before = now_millis();
        let pair = grant.into_pair("r1");
        assert_eq!(pair.refresh.expose(), "r2");
        let expires_at = pair.expires_at.unwrap();
        assert!(expires_at >= before + 3_600_000);
    }

    #[test]
    fn empty_rotated_token_is_ignored() {
        let grant: RefreshGrant =
            serde_json::from_str(r#"{"access_token":"a2","refresh_token":""}"#).unwrap();
        assert_eq!(grant.into_pair("r1").refresh.expose(), "r1");
    }

    #[test]
    fn expiry_window() {
        let soon = TokenPair::new("a", "r").with_expires_at(Some(now_millis() + 30_000));
        assert!(soon.expires_within(Duration::from_secs(60)));
        assert!(!soon.expires_within(Duration::from_secs(1)));

        let unknown = TokenPair::new("a", "r");
        assert!(!unknown.expires_within(Duration::from_secs(3600)));
    }

    #[test]
    fn refresh_request_serializes_snake_case() {
        let json = serde_json::to_string(&RefreshRequest { refresh_token: "r1" }).unwrap();
        assert_eq!(json, r#"{"refresh_token":"r1"}"#);
    }

    #[test]
    fn token_pair_debug_is_redacted() {
        let debug = format!("{:?}", TokenPair::new("at_visible", "rt_visible"));
        assert!(!debug.contains("at_visible"));
        assert!(!debug.contains("rt_visible"));
    }
}
