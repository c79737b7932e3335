//! Session credentials for the Lyo API
//!
//! Owns the access/refresh token pair for one signed-in user: where it is
//! persisted, how requests are signed with it, and how it is refreshed. The
//! request pipeline and the stream connection both hold an
//! `Arc<SessionManager>` and never touch tokens directly.
//!
//! Credential flow:
//! 1. `SessionManager::restore()` loads a pair persisted by a previous run
//! 2. Login calls `SessionManager::set_tokens()`, which persists both tokens
//! 3. Every outbound call is signed via `SessionManager::authorize()`
//! 4. A 401 triggers `SessionManager::refresh_after()` (single-flight)
//! 5. `spawn_refresh_task()` refreshes ahead of a known expiry
//! 6. Logout, or any refresh failure, clears memory and store together

pub mod constants;
pub mod credentials;
pub mod error;
pub mod file_store;
pub mod refresh;
pub mod session;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialKey, CredentialStore, MemoryCredentialStore, StoreFuture};
pub use error::{Error, Result};
pub use file_store::{FileCredentialStore, SealingKey};
pub use refresh::spawn_refresh_task;
pub use session::{SessionManager, TokenGeneration};
pub use token::{RefreshGrant, TokenPair};
