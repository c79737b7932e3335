//! Secret wrapper for credential material
//!
//! Access tokens, refresh tokens and sealing keys travel through the session
//! crates inside `Secret`. Formatting never reveals the value, and the backing
//! memory is zeroized when the wrapper is dropped.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Whether the wrapped string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short, stable identifier for log lines.
    ///
    /// First 8 hex characters of the SHA-256 of the value. Two log lines with
    /// the same fingerprint refer to the same token without revealing it.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret<String> {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Zeroize + PartialEq> PartialEq for Secret<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_redacted_in_debug_and_display() {
        let token = Secret::from("at_live_123");
        assert_eq!(format!("{token:?}"), "[REDACTED]");
        assert_eq!(format!("{token}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let token = Secret::new(String::from("rt_456"));
        assert_eq!(token.expose(), "rt_456");
        assert!(!token.is_empty());
        assert!(Secret::from("").is_empty());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = Secret::from("at_same");
        let b = Secret::from("at_same");
        let c = Secret::from("at_other");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 8);
        assert!(!a.fingerprint().contains("at_same"));
    }

    #[test]
    fn sealing_key_bytes_are_redacted() {
        let key = Secret::new([7u8; 32]);
        assert_eq!(format!("{key:?}"), "[REDACTED]");
        assert_eq!(key.expose()[0], 7);
    }
}
