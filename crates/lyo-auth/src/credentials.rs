//! Credential storage capability
//!
//! The session manager persists its token pair through `CredentialStore`, a
//! three-operation capability (save, load, delete) keyed by two fixed
//! identifiers. Backends decide where the bytes live; `FileCredentialStore`
//! seals them on disk, `MemoryCredentialStore` keeps them in process.
//!
//! Store failures never abort request flow: `save` logs and reports `false`,
//! `load` answers `None`, `delete` is a silent no-op when nothing is stored.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use common::Secret;
use tokio::sync::Mutex;
use tracing::debug;

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

/// Boxed future returned by store operations (keeps the trait dyn-compatible).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The two persisted credential entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 2] = [CredentialKey::AccessToken, CredentialKey::RefreshToken];

    /// Stable identifier used by persistent backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::AccessToken => ACCESS_TOKEN_KEY,
            CredentialKey::RefreshToken => REFRESH_TOKEN_KEY,
        }
    }
}

/// Secure at-rest storage for the access/refresh token pair.
///
/// Uses `Pin<Box<dyn Future>>` return types so the session manager can hold an
/// `Arc<dyn CredentialStore>`.
pub trait CredentialStore: Send + Sync {
    /// Replace any prior value for `key`.
    ///
    /// Logical delete-then-insert: the previous value is gone even if the
    /// insert fails, and a concurrent `load` sees either the old or the new
    /// value, never a partial one. Returns whether the new value was persisted.
    fn save<'a>(&'a self, key: CredentialKey, value: &'a str) -> StoreFuture<'a, bool>;

    fn load(&self, key: CredentialKey) -> StoreFuture<'_, Option<String>>;

    /// Remove the value for `key`; no-op when absent.
    fn delete(&self, key: CredentialKey) -> StoreFuture<'_, ()>;
}

/// Process-local credential store.
///
/// Nothing survives a restart. Used for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<CredentialKey, Secret<String>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save<'a>(&'a self, key: CredentialKey, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            entries.insert(key, Secret::from(value));
            debug!(key = key.as_str(), "stored credential in memory");
            true
        })
    }

    fn load(&self, key: CredentialKey) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            entries.get(&key).map(|secret| secret.expose().clone())
        })
    }

    fn delete(&self, key: CredentialKey) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.entries.lock().await.remove(&key).is_some() {
                debug!(key = key.as_str(), "removed credential from memory");
            }
        })
    }
}
