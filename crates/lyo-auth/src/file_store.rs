//! Sealed on-disk credential store
//!
//! Keeps a JSON file mapping credential identifiers to ChaCha20-Poly1305
//! sealed entries. Each write uses a fresh random nonce. The whole file is
//! rewritten with temp-file + rename so a crash mid-write never leaves a
//! truncated file, and permissions are 0600 on unix.
//!
//! A tokio Mutex serializes every operation, so a `load` can never observe a
//! half-applied `save`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialKey, CredentialStore, StoreFuture};
use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// 256-bit key used to seal credential entries.
#[derive(Clone)]
pub struct SealingKey(Secret<[u8; 32]>);

impl SealingKey {
    /// Derive a key from arbitrary key material (passphrase, key file contents).
    pub fn derive(material: &str) -> Self {
        let digest = Sha256::digest(material.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(Secret::new(key))
    }

    /// Generate a random key. Entries sealed with it are unreadable after
    /// the key is dropped.
    pub fn generate() -> Self {
        Self(Secret::new(random_bytes::<32>()))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.0.expose()))
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealingKey({:?})", self.0)
    }
}

/// One sealed value as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEntry {
    nonce: String,
    ciphertext: String,
}

/// Credential store backed by a sealed JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
    key: SealingKey,
    state: Mutex<HashMap<String, SealedEntry>>,
}

impl FileCredentialStore {
    /// Open the store at `path`.
    ///
    /// If the file doesn't exist it is created as `{}`, so a first launch
    /// starts with no credentials.
    pub async fn open(path: PathBuf, key: SealingKey) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, SealedEntry> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "opened credential store");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            key,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `state` after a failed save dropped `key`, so the previous value
    /// does not come back on the next open. Falls back to rewriting the file
    /// in place when the temp-file route is unavailable.
    async fn persist_removal(&self, key: CredentialKey, state: &HashMap<String, SealedEntry>) {
        let Err(e) = write_atomic(&self.path, state).await else {
            return;
        };
        debug!(key = key.as_str(), error = %e, "atomic removal failed, rewriting in place");
        if let Err(e) = write_in_place(&self.path, state).await {
            warn!(
                key = key.as_str(),
                error = %e,
                "previous credential value may remain on disk"
            );
        }
    }

    fn seal(&self, plaintext: &str) -> Result<SealedEntry> {
        let nonce = random_bytes::<NONCE_LEN>();
        let ciphertext = self
            .key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".into()))?;
        Ok(SealedEntry {
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    fn unseal(&self, entry: &SealedEntry) -> Result<String> {
        let nonce = STANDARD
            .decode(&entry.nonce)
            .map_err(|e| Error::CredentialParse(format!("nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::CredentialParse(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&entry.ciphertext)
            .map_err(|e| Error::CredentialParse(format!("ciphertext: {e}")))?;
        let plaintext = self
            .key
            .cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| Error::Crypto("decryption failed (wrong key or tampered entry)".into()))?;
        String::from_utf8(plaintext).map_err(|e| Error::CredentialParse(format!("utf-8: {e}")))
    }
}

impl CredentialStore for FileCredentialStore {
    fn save<'a>(&'a self, key: CredentialKey, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let had_prior = state.remove(key.as_str()).is_some();

            let entry = match self.seal(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "failed to seal credential");
                    if had_prior {
                        self.persist_removal(key, &state).await;
                    }
                    return false;
                }
            };
            state.insert(key.as_str().to_string(), entry);

            match write_atomic(&self.path, &state).await {
                Ok(()) => {
                    debug!(key = key.as_str(), "saved credential");
                    true
                }
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "failed to persist credential");
                    state.remove(key.as_str());
                    if had_prior {
                        self.persist_removal(key, &state).await;
                    }
                    false
                }
            }
        })
    }

    fn load(&self, key: CredentialKey) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let entry = state.get(key.as_str())?;
            match self.unseal(entry) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "ignoring unreadable credential");
                    None
                }
            }
        })
    }

    fn delete(&self, key: CredentialKey) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key.as_str()).is_none() {
                return;
            }
            if let Err(e) = write_atomic(&self.path, &state).await {
                warn!(key = key.as_str(), error = %e, "failed to persist credential removal");
            } else {
                debug!(key = key.as_str(), "deleted credential");
            }
        })
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    bytes
}

/// Write the entry map atomically with 0600 permissions.
fn temp_path(path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    Ok(dir.join(format!(".credentials.tmp.{}", std::process::id())))
}

/// Non-atomic rewrite; only used to erase entries.
async fn write_in_place(path: &Path, data: &HashMap<String, SealedEntry>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
    tokio::fs::write(path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("rewriting credential file: {e}")))
}

async fn write_atomic(path: &Path, data: &HashMap<String, SealedEntry>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let tmp_path = temp_path(path)?;

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    Ok(())
}
