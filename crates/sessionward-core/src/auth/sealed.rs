//! Authenticated encryption wrapper for any [`KvStore`].
//!
//! Values are sealed with ChaCha20-Poly1305 under a key derived from a
//! caller-provided secret with Argon2. A value that fails authentication
//! (edited on disk, written under another key) reads back as absent.

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use tracing::warn;

use super::storage::{KvStore, StorageError};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Fixed salt prefix; the namespace is appended so each store gets its own key.
const SALT_PREFIX: &str = "sessionward.sealed.v1:";

pub struct SealedStore<S> {
    inner: S,
    cipher: ChaCha20Poly1305,
}

impl<S: KvStore> SealedStore<S> {
    /// Derive the sealing key from `secret` and wrap `inner`.
    pub fn new(inner: S, secret: &[u8], namespace: &str) -> Result<Self, StorageError> {
        let salt = format!("{}{}", SALT_PREFIX, namespace);
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(secret, salt.as_bytes(), &mut key)
            .map_err(|e| StorageError::Unavailable(format!("key derivation failed: {}", e)))?;
        Ok(Self::with_key(inner, key))
    }

    /// Wrap `inner` with an already-derived 256-bit key.
    pub fn with_key(inner: S, key: [u8; KEY_LEN]) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Random secret suitable for `new`, base64 encoded for storage.
    pub fn generate_secret() -> String {
        let mut secret = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        STANDARD.encode(secret)
    }

    fn seal(&self, plaintext: &str) -> Result<String, StorageError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| StorageError::Unavailable("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn open(&self, sealed: &str) -> Option<String> {
        let bytes = STANDARD.decode(sealed).ok()?;
        if bytes.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

impl<S: KvStore> KvStore for SealedStore<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let Some(sealed) = self.inner.get(key)? else {
            return Ok(None);
        };
        match self.open(&sealed) {
            Some(value) => Ok(Some(value)),
            None => {
                warn!(key = key, "Sealed value failed verification, discarding");
                self.inner.remove(key)?;
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let sealed = self.seal(value)?;
        self.inner.set(key, &sealed)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStore;

    #[test]
    fn test_sealed_value_is_not_plaintext() {
        let backing = MemoryStore::new();
        let sealed = SealedStore::with_key(backing.clone(), [7u8; KEY_LEN]);

        sealed.set("session", "secret-token").unwrap();
        let raw = backing.get("session").unwrap().unwrap();
        assert!(!raw.contains("secret-token"));
        assert_eq!(sealed.get("session").unwrap().as_deref(), Some("secret-token"));
    }

    #[test]
    fn test_tampered_value_reads_as_absent_and_is_removed() {
        let backing = MemoryStore::new();
        let sealed = SealedStore::with_key(backing.clone(), [7u8; KEY_LEN]);
        sealed.set("session", "secret-token").unwrap();

        let mut raw = STANDARD.decode(backing.get("session").unwrap().unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        backing.set("session", &STANDARD.encode(raw)).unwrap();

        assert_eq!(sealed.get("session").unwrap(), None);
        assert_eq!(backing.get("session").unwrap(), None);
    }

    #[test]
    fn test_derived_keys_are_stable_per_namespace() {
        let secret = SealedStore::<MemoryStore>::generate_secret();
        assert_ne!(secret, SealedStore::<MemoryStore>::generate_secret());

        let backing = MemoryStore::new();
        SealedStore::new(backing.clone(), secret.as_bytes(), "session")
            .unwrap()
            .set("k", "v")
            .unwrap();

        let reopened = SealedStore::new(backing.clone(), secret.as_bytes(), "session").unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));

        let other = SealedStore::new(backing, secret.as_bytes(), "elsewhere").unwrap();
        assert_eq!(other.get("k").unwrap(), None);
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let backing = MemoryStore::new();
        SealedStore::with_key(backing.clone(), [1u8; KEY_LEN])
            .set("k", "v")
            .unwrap();
        let other = SealedStore::with_key(backing, [2u8; KEY_LEN]);
        assert_eq!(other.get("k").unwrap(), None);
    }

    #[test]
    fn test_derived_key_is_stable_per_secret() {
        let backing = MemoryStore::new();
        SealedStore::new(backing.clone(), b"machine-secret", "persistent")
            .unwrap()
            .set("k", "v")
            .unwrap();
        let reopened = SealedStore::new(backing, b"machine-secret", "persistent").unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
    }
}
