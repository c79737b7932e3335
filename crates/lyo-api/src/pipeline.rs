//! Request pipeline
//!
//! `send` serializes the body once, then runs at most two attempts of the same
//! logical request. Each attempt is signed right before it goes out, and the
//! token generation it was signed with is handed back to the session manager
//! on a 401, so concurrent callers that all see 401 trigger a single refresh.

use std::sync::Arc;

use bytes::Bytes;
use common::ProblemDetails;
use lyo_auth::{SessionManager, api_url};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_RETRIES: u8 = 1;

/// One logical call. `retry_count` is 0 on the first attempt, 1 on the retry.
struct RequestContext {
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    retry_count: u8,
}

/// What to do with a response, decided from status and retry count alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Decode,
    RefreshAndRetry,
    Unauthorized,
    Client,
    Server,
    Unexpected,
}

fn classify(status: StatusCode, retry_count: u8) -> Disposition {
    match status.as_u16() {
        200..=299 => Disposition::Decode,
        401 if retry_count < MAX_RETRIES => Disposition::RefreshAndRetry,
        401 => Disposition::Unauthorized,
        400..=499 => Disposition::Client,
        500..=599 => Disposition::Server,
        _ => Disposition::Unexpected,
    }
}

/// Server problem document, or a generic one carrying the status.
fn problem_from(status: StatusCode, body: &[u8]) -> ProblemDetails {
    ProblemDetails::from_body(body).unwrap_or_else(|| ProblemDetails::from_status(status.as_u16()))
}

fn record(outcome: &'static str) {
    metrics::counter!("api_requests_total", "outcome" => outcome).increment(1);
}

/// Authenticated JSON client for `{base}/v1/...`.
#[derive(Clone)]
pub struct RequestPipeline {
    client: reqwest::Client,
    base_url: String,
    session: Arc<SessionManager>,
}

impl RequestPipeline {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client, session: Arc<SessionManager>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Send `body` as JSON to `path` and decode the response into `T`.
    ///
    /// An empty 2xx body decodes as JSON `null`, so `T = ()` accepts 204.
    #[instrument(skip_all, fields(method = %method, path = %path, request_id = tracing::field::Empty))]
    pub async fn send<T, B>(
        &self,
        path: &str,
        method: Method,
        body: Option<&B>,
        headers: &[(&str, &str)],
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = match body {
            Some(body) => Some(Bytes::from(serde_json::to_vec(body).map_err(|e| {
                record("encode_error");
                Error::Encode(e)
            })?)),
            None => None,
        };

        let request_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let mut ctx = RequestContext {
            url: api_url(&self.base_url, path),
            method,
            headers: standard_headers(&request_id, headers)?,
            body,
            retry_count: 0,
        };

        loop {
            let mut headers = ctx.headers.clone();
            let generation = self.session.authorize(&mut headers).await;

            let mut request = self
                .client
                .request(ctx.method.clone(), &ctx.url)
                .headers(headers);
            if let Some(body) = &ctx.body {
                request = request.body(body.clone());
            }

            let response = request.send().await.map_err(|e| {
                record("network_error");
                warn!(error = %e, "request failed");
                Error::Network(e)
            })?;
            let status = response.status();
            let bytes = response.bytes().await.map_err(|e| {
                record("network_error");
                warn!(error = %e, status = status.as_u16(), "reading response body failed");
                Error::Network(e)
            })?;

            match classify(status, ctx.retry_count) {
                Disposition::Decode => {
                    let payload: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
                    return match serde_json::from_slice(payload) {
                        Ok(value) => {
                            record("success");
                            debug!(status = status.as_u16(), "request succeeded");
                            Ok(value)
                        }
                        Err(e) => {
                            record("decode_error");
                            warn!(error = %e, status = status.as_u16(), "response did not match expected shape");
                            Err(Error::Decode {
                                status: status.as_u16(),
                                message: e.to_string(),
                            })
                        }
                    };
                }
                Disposition::RefreshAndRetry => {
                    debug!("401, refreshing token and retrying once");
                    if let Err(e) = self.session.refresh_after(generation).await {
                        record("unauthorized");
                        warn!(error = %e, "token refresh failed");
                        let problem = e
                            .problem()
                            .cloned()
                            .unwrap_or_else(|| ProblemDetails::unauthorized(Some(e.to_string())));
                        return Err(Error::Unauthorized(problem));
                    }
                    ctx.retry_count += 1;
                }
                Disposition::Unauthorized => {
                    record("unauthorized");
                    warn!("still unauthorized after refresh");
                    return Err(Error::Unauthorized(problem_from(status, &bytes)));
                }
                Disposition::Client => {
                    record("client_error");
                    return Err(Error::Client(problem_from(status, &bytes)));
                }
                Disposition::Server => {
                    record("server_error");
                    return Err(Error::Server(problem_from(status, &bytes)));
                }
                Disposition::Unexpected => {
                    record("unexpected_status");
                    return Err(Error::UnexpectedStatus(status.as_u16()));
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send::<T, ()>(path, Method::GET, None, &[]).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(path, Method::POST, Some(body), &[]).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(path, Method::PUT, Some(body), &[]).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(path, Method::PATCH, Some(body), &[]).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send::<T, ()>(path, Method::DELETE, None, &[]).await
    }
}

/// JSON content negotiation, request id, then caller headers on top.
fn standard_headers(request_id: &str, extra: &[(&str, &str)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let request_id = HeaderValue::from_str(request_id)
        .map_err(|e| Error::InvalidRequest(format!("request id: {e}")))?;
    headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), request_id);

    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("header {name} value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
