//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the session's access token when it
//! is about to expire, so most requests never pay for a 401 round-trip. The
//! task goes through `SessionManager::refresh`, so it joins any refresh a
//! request already started instead of racing it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::session::SessionManager;

/// Spawn a background task that proactively refreshes an expiring token.
///
/// Runs every `interval` and refreshes when the access token expires within
/// `threshold`. Pairs with unknown expiry are left to the 401 path. A failed
/// refresh clears the session, after which cycles are no-ops until the next
/// login.
///
/// Returns a `JoinHandle` for the spawned task; abort it on shutdown.
pub fn spawn_refresh_task(
    session: Arc<SessionManager>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; tokens were just restored or set
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&session, threshold).await;
        }
    })
}

/// Run one cycle: refresh if the current token is inside the window.
async fn refresh_cycle(session: &SessionManager, threshold: Duration) {
    if !session.is_authenticated().await {
        return;
    }
    if !session.expires_within(threshold).await {
        return;
    }

    debug!("access token expiring within threshold, refreshing");
    match session.refresh().await {
        Ok(()) => info!("background token refresh succeeded"),
        Err(e) => warn!(error = %e, "background token refresh failed"),
    }
}
