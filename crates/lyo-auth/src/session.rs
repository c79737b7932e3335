//! Session manager: the single owner of the in-memory token pair
//!
//! Every request and stream upgrade is signed through `authorize`, and every
//! mutation goes through `set_tokens`, `clear_tokens` or `refresh`. Writers
//! hold the token write lock across the memory update *and* the persist step,
//! so `authorize` never observes a half-replaced pair.
//!
//! Refresh is single-flight. The first caller becomes the leader and performs
//! the network call; callers arriving while it runs wait on a `watch` channel
//! and receive the leader's outcome. Each token replacement bumps a generation
//! counter, which lets a caller holding a stale 401 skip the refresh entirely
//! when the pair has already been replaced since its request was signed.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, instrument, warn};

use crate::constants::{REFRESH_PATH, api_url};
use crate::credentials::{CredentialKey, CredentialStore};
use crate::error::{Error, Result};
use crate::token::{TokenPair, request_refresh};

/// Opaque marker of which token pair signed a request.
///
/// Returned by [`SessionManager::authorize`] and handed back to
/// [`SessionManager::refresh_after`] when that request comes back 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGeneration(u64);

#[derive(Default)]
struct SessionState {
    tokens: Option<TokenPair>,
    generation: u64,
}

/// Outcome published to waiters; `None` while the flight is running.
type FlightOutcome = Option<Result<()>>;

enum Flight {
    Lead(watch::Sender<FlightOutcome>),
    Follow(watch::Receiver<FlightOutcome>),
}

/// Clears the in-flight slot when the leader finishes or is dropped.
struct FlightGuard<'a> {
    slot: &'a Mutex<Option<watch::Receiver<FlightOutcome>>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Owns credentials for one signed-in user.
pub struct SessionManager {
    state: RwLock<SessionState>,
    store: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    refresh_url: String,
    in_flight: Mutex<Option<watch::Receiver<FlightOutcome>>>,
    authenticated: watch::Sender<bool>,
}

impl SessionManager {
    /// Create an unauthenticated session against `base_url`.
    ///
    /// Call [`restore`](Self::restore) to pick up credentials persisted by a
    /// previous run.
    pub fn new(base_url: &str, store: Arc<dyn CredentialStore>, client: reqwest::Client) -> Self {
        let (authenticated, _) = watch::channel(false);
        Self {
            state: RwLock::new(SessionState::default()),
            store,
            client,
            refresh_url: api_url(base_url, REFRESH_PATH),
            in_flight: Mutex::new(None),
            authenticated,
        }
    }

    /// Load the persisted pair. Returns whether the session is now authenticated.
    ///
    /// A store holding only one of the two tokens is repaired by deleting both.
    pub async fn restore(&self) -> bool {
        let mut state = self.state.write().await;
        let access = self.store.load(CredentialKey::AccessToken).await;
        let refresh = self.store.load(CredentialKey::RefreshToken).await;

        match (access, refresh) {
            (Some(access), Some(refresh)) => {
                let pair = TokenPair::new(access, refresh);
                info!(access = %pair.access.fingerprint(), "restored tokens from store");
                state.tokens = Some(pair);
                state.generation += 1;
                self.authenticated.send_replace(true);
                true
            }
            (None, None) => {
                debug!("no stored tokens");
                false
            }
            _ => {
                warn!("store held only one of the token pair, discarding both");
                self.erase_persisted().await;
                false
            }
        }
    }

    /// Attach `Authorization: Bearer {access}` when a pair is present.
    pub async fn authorize(&self, headers: &mut HeaderMap) -> TokenGeneration {
        let state = self.state.read().await;
        if let Some(tokens) = &state.tokens {
            match HeaderValue::from_str(&format!("Bearer {}", tokens.access.expose())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => {
                    warn!(error = %e, "access token is not a valid header value, sending unsigned")
                }
            }
        }
        TokenGeneration(state.generation)
    }

    /// Replace the pair (login) and persist both tokens.
    pub async fn set_tokens(&self, access: impl Into<String>, refresh: impl Into<String>) {
        self.set_token_pair(TokenPair::new(access, refresh)).await;
    }

    pub async fn set_token_pair(&self, pair: TokenPair) {
        let mut state = self.state.write().await;
        self.install(&mut state, pair).await;
    }

    /// Drop the pair from memory and from the store (logout).
    pub async fn clear_tokens(&self) {
        let mut state = self.state.write().await;
        self.uninstall(&mut state).await;
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// At most one refresh request is in flight: concurrent callers wait for
    /// the running one and share its outcome. Any failure clears the session.
    pub async fn refresh(&self) -> Result<()> {
        self.refresh_inner(None).await
    }

    /// Refresh on behalf of a request signed with `seen` that came back 401.
    ///
    /// If the pair was replaced since then, no network call is made: the
    /// caller can simply retry (or, if the session was cleared, re-login).
    pub async fn refresh_after(&self, seen: TokenGeneration) -> Result<()> {
        self.refresh_inner(Some(seen)).await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.tokens.is_some()
    }

    /// Whether the current access token expires within `threshold`.
    pub async fn expires_within(&self, threshold: Duration) -> bool {
        let state = self.state.read().await;
        state
            .tokens
            .as_ref()
            .is_some_and(|tokens| tokens.expires_within(threshold))
    }

    pub async fn generation(&self) -> TokenGeneration {
        TokenGeneration(self.state.read().await.generation)
    }

    /// Watch authentication changes (true after login/refresh, false after clear).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.authenticated.subscribe()
    }

    async fn refresh_inner(&self, seen: Option<TokenGeneration>) -> Result<()> {
        let flight = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(rx) => Flight::Follow(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Flight::Lead(tx)
                }
            }
        };

        match flight {
            Flight::Follow(mut rx) => {
                debug!("refresh already in flight, waiting for its outcome");
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => (*outcome).clone(),
                    Err(_) => None,
                };
                outcome.unwrap_or(Err(Error::RefreshAbandoned))
            }
            Flight::Lead(tx) => {
                let _guard = FlightGuard {
                    slot: &self.in_flight,
                };
                let result = self.lead_refresh(seen).await;
                tx.send_replace(Some(result.clone()));
                result
            }
        }
    }

    #[instrument(skip_all)]
    async fn lead_refresh(&self, seen: Option<TokenGeneration>) -> Result<()> {
        let (generation, refresh_token) = {
            let state = self.state.read().await;
            if let Some(TokenGeneration(seen)) = seen {
                if state.generation != seen {
                    debug!("token pair replaced since the request was signed, skipping refresh");
                    return match state.tokens {
                        Some(_) => Ok(()),
                        None => Err(Error::Unauthorized("session was signed out".into())),
                    };
                }
            }
            let refresh_token: Option<Secret<String>> = state
                .tokens
                .as_ref()
                .map(|tokens| tokens.refresh.clone())
                .filter(|token| !token.is_empty());
            (state.generation, refresh_token)
        };

        let Some(refresh_token) = refresh_token else {
            metrics::counter!("session_refresh_total", "outcome" => "missing_token").increment(1);
            return Err(Error::MissingRefreshToken);
        };

        info!(refresh = %refresh_token.fingerprint(), "refreshing access token");
        let result = request_refresh(&self.client, &self.refresh_url, refresh_token.expose()).await;

        let mut state = self.state.write().await;
        if state.generation != generation {
            // Login or logout happened while the request was out; it wins.
            warn!("session changed during refresh, discarding refresh result");
            return match state.tokens {
                Some(_) => Ok(()),
                None => Err(Error::Unauthorized("session was signed out".into())),
            };
        }

        match result {
            Ok(grant) => {
                let pair = grant.into_pair(refresh_token.expose());
                self.install(&mut state, pair).await;
                metrics::counter!("session_refresh_total", "outcome" => "success").increment(1);
                info!("access token refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, clearing session");
                self.uninstall(&mut state).await;
                metrics::counter!("session_refresh_total", "outcome" => "failure").increment(1);
                Err(e)
            }
        }
    }

    /// Caller holds the write lock.
    async fn install(&self, state: &mut SessionState, pair: TokenPair) {
        let saved_access = self
            .store
            .save(CredentialKey::AccessToken, pair.access.expose())
            .await;
        let saved_refresh = self
            .store
            .save(CredentialKey::RefreshToken, pair.refresh.expose())
            .await;
        if !(saved_access && saved_refresh) {
            warn!("could not persist token pair, keeping it in memory only");
            self.erase_persisted().await;
        }

        debug!(access = %pair.access.fingerprint(), "tokens updated");
        state.tokens = Some(pair);
        state.generation += 1;
        self.authenticated.send_replace(true);
    }

    /// Caller holds the write lock.
    async fn uninstall(&self, state: &mut SessionState) {
        let had_tokens = state.tokens.take().is_some();
        state.generation += 1;
        self.erase_persisted().await;
        self.authenticated.send_replace(false);
        if had_tokens {
            info!("tokens cleared");
        }
    }

    async fn erase_persisted(&self) {
        for key in CredentialKey::ALL {
            self.store.delete(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone)]
    struct MockRefresh {
        hits: Arc<AtomicUsize>,
        seen_tokens: Arc<Mutex<Vec<String>>>,
        status: u16,
        body: serde_json::Value,
        delay: Duration,
    }

    async fn refresh_handler(
        State(mock): State<MockRefresh>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        mock.hits.fetch_add(1, Ordering::SeqCst);
        mock.seen_tokens
            .lock()
            .push(body["refresh_token"].as_str().unwrap_or_default().to_string());
        tokio::time::sleep(mock.delay).await;
        (StatusCode::from_u16(mock.status).unwrap(), Json(mock.body.clone()))
    }

    /// Start a refresh endpoint answering every call with `status` + `body`.
    async fn start_refresh_server(
        status: u16,
        body: serde_json::Value,
        delay: Duration,
    ) -> (String, MockRefresh) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let mock = MockRefresh {
            hits: Arc::new(AtomicUsize::new(0)),
            seen_tokens: Arc::new(Mutex::new(Vec::new())),
            status,
            body,
            delay,
        };
        let app = Router::new()
            .route("/v1/auth/refresh", post(refresh_handler))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, mock)
    }

    fn session_with(base: &str) -> (Arc<SessionManager>, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let session = Arc::new(SessionManager::new(
            base,
            store.clone(),
            reqwest::Client::new(),
        ));
        (session, store)
    }

    async fn bearer(session: &SessionManager) -> Option<String> {
        let mut headers = HeaderMap::new();
        session.authorize(&mut headers).await;
        headers
            .get(AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn authorize_without_tokens_adds_nothing() {
        let (session, _) = session_with("http://127.0.0.1:1");
        assert_eq!(bearer(&session).await, None);
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn set_tokens_signs_with_access_and_persists_both() {
        let (session, store) = session_with("http://127.0.0.1:1");
        session.set_tokens("A", "B").await;

        assert_eq!(bearer(&session).await.as_deref(), Some("Bearer A"));
        assert_eq!(store.load(CredentialKey::AccessToken).await.as_deref(), Some("A"));
        assert_eq!(store.load(CredentialKey::RefreshToken).await.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn clear_tokens_removes_header_and_store_entries() {
        let (session, store) = session_with("http://127.0.0.1:1");
        session.set_tokens("A", "B").await;
        session.clear_tokens().await;

        assert_eq!(bearer(&session).await, None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn authorization_header_is_sensitive() {
        let (session, _) = session_with("http://127.0.0.1:1");
        session.set_tokens("A", "B").await;
        let mut headers = HeaderMap::new();
        session.authorize(&mut headers).await;
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
    }

    #[tokio::test]
    async fn restore_loads_complete_pair() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.save(CredentialKey::AccessToken, "a1").await;
        store.save(CredentialKey::RefreshToken, "r1").await;

        let session = SessionManager::new("http://127.0.0.1:1", store, reqwest::Client::new());
        assert!(session.restore().await);
        assert_eq!(bearer(&session).await.as_deref(), Some("Bearer a1"));
    }

    #[tokio::test]
    async fn restore_repairs_half_persisted_pair() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.save(CredentialKey::AccessToken, "orphan").await;

        let session =
            SessionManager::new("http://127.0.0.1:1", store.clone(), reqwest::Client::new());
        assert!(!session.restore().await);
        assert!(store.is_empty().await);
        assert_eq!(bearer(&session).await, None);
    }

    #[tokio::test]
    async fn refresh_without_rotation_keeps_refresh_token() {
        let (base, mock) = start_refresh_server(
            200,
            serde_json::json!({"access_token": "a2"}),
            Duration::ZERO,
        )
        .await;
        let (session, store) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        session.refresh().await.unwrap();

        assert_eq!(bearer(&session).await.as_deref(), Some("Bearer a2"));
        assert_eq!(store.load(CredentialKey::AccessToken).await.as_deref(), Some("a2"));
        assert_eq!(store.load(CredentialKey::RefreshToken).await.as_deref(), Some("r1"));
        assert_eq!(*mock.seen_tokens.lock(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn refresh_with_rotation_and_expiry() {
        let (base, _) = start_refresh_server(
            200,
            serde_json::json!({"access_token": "a2", "refresh_token": "r2", "expires_in": 30}),
            Duration::ZERO,
        )
        .await;
        let (session, store) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        session.refresh().await.unwrap();

        assert_eq!(store.load(CredentialKey::RefreshToken).await.as_deref(), Some("r2"));
        assert!(session.expires_within(Duration::from_secs(60)).await);
        assert!(!session.expires_within(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn refresh_rejection_clears_and_surfaces_problem() {
        let (base, _) = start_refresh_server(
            401,
            serde_json::json!({"title": "Unauthorized", "status": 401, "detail": "refresh token revoked"}),
            Duration::ZERO,
        )
        .await;
        let (session, store) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let err = session.refresh().await.unwrap_err();
        let problem = err.problem().expect("problem document");
        assert_eq!(problem.detail.as_deref(), Some("refresh token revoked"));
        assert!(!session.is_authenticated().await);
        assert!(store.is_empty().await);
        assert_eq!(bearer(&session).await, None);
    }

    #[tokio::test]
    async fn refresh_failure_without_problem_carries_status() {
        let (base, _) =
            start_refresh_server(500, serde_json::Value::Null, Duration::ZERO).await;
        let (session, _) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed { status: 500 }), "got {err:?}");
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn empty_access_token_is_unauthorized() {
        let (base, _) = start_refresh_server(
            200,
            serde_json::json!({"access_token": ""}),
            Duration::ZERO,
        )
        .await;
        let (session, _) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)), "got {err:?}");
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn transport_failure_clears_session() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let (session, store) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn missing_refresh_token_makes_no_call() {
        let (base, mock) = start_refresh_server(
            200,
            serde_json::json!({"access_token": "a2"}),
            Duration::ZERO,
        )
        .await;
        let (session, _) = session_with(&base);

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_request() {
        let (base, mock) = start_refresh_server(
            200,
            serde_json::json!({"access_token": "a2"}),
            Duration::from_millis(150),
        )
        .await;
        let (session, _) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let mut handles = vec![];
        for _ in 0..16 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.refresh().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
        assert_eq!(bearer(&session).await.as_deref(), Some("Bearer a2"));
    }

    #[tokio::test]
    async fn concurrent_waiters_all_see_failure() {
        let (base, mock) =
            start_refresh_server(403, serde_json::Value::Null, Duration::from_millis(150)).await;
        let (session, _) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let mut handles = vec![];
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.refresh().await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::RefreshFailed { status: 403 }), "got {err:?}");
        }

        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn stale_generation_skips_network() {
        let (base, mock) = start_refresh_server(
            200,
            serde_json::json!({"access_token": "a3"}),
            Duration::ZERO,
        )
        .await;
        let (session, _) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let mut headers = HeaderMap::new();
        let signed_with = session.authorize(&mut headers).await;
        session.set_tokens("a2", "r2").await;

        session.refresh_after(signed_with).await.unwrap();
        assert_eq!(mock.hits.load(Ordering::SeqCst), 0);
        assert_eq!(bearer(&session).await.as_deref(), Some("Bearer a2"));
    }

    #[tokio::test]
    async fn stale_generation_after_logout_is_unauthorized() {
        let (session, _) = session_with("http://127.0.0.1:1");
        session.set_tokens("a1", "r1").await;
        let signed_with = session.generation().await;
        session.clear_tokens().await;

        let err = session.refresh_after(signed_with).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn abandoned_leader_releases_waiters() {
        let (base, mock) = start_refresh_server(
            200,
            serde_json::json!({"access_token": "a2"}),
            Duration::from_millis(300),
        )
        .await;
        let (session, _) = session_with(&base);
        session.set_tokens("a1", "r1").await;

        let leader = {
            let session = session.clone();
            tokio::spawn(async move { session.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let follower = {
            let session = session.clone();
            tokio::spawn(async move { session.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        leader.abort();

        let err = follower.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::RefreshAbandoned), "got {err:?}");

        // The slot is free again: a new refresh performs its own request.
        session.refresh().await.unwrap();
        assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscribers_observe_sign_in_and_out() {
        let (session, _) = session_with("http://127.0.0.1:1");
        let mut rx = session.subscribe();
        assert!(!*rx.borrow_and_update());

        session.set_tokens("a1", "r1").await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        session.clear_tokens().await;
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }
}
