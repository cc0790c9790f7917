//! Private-key holder used to sign and verify log entries
//!
//! The keystore maps a key id (hex of the raw public key) to the private key
//! of a local member or device. It is the trust boundary between the log
//! substrate and the stores: entries are signed on write through
//! [`SignedEntryKeyStore::sign`] and verified on read through
//! [`SignedEntryKeyStore::verify`] before any index sees them.
//!
//! Private keys never leave the process.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{GroupError, GroupResult};
use crate::identity::{key_id, PrivKey, PubKey};

/// Per-process private key map.
#[derive(Default)]
pub struct SignedEntryKeyStore {
    keys: RwLock<HashMap<String, PrivKey>>,
}

impl SignedEntryKeyStore {
    /// Create an empty keystore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a private key under the id of its public key.
    pub fn set_key(&self, key: PrivKey) -> String {
        let id = key_id(&key.public());
        self.keys.write().insert(id.clone(), key);
        id
    }

    /// Whether a key is registered under `id`.
    pub fn has_key(&self, id: &str) -> bool {
        self.keys.read().contains_key(id)
    }

    /// Same as [`SignedEntryKeyStore::get_key`]; keys are never generated here.
    pub fn create_key(&self, id: &str) -> GroupResult<PrivKey> {
        self.get_key(id)
    }

    /// Look up the private key registered under `id`.
    pub fn get_key(&self, id: &str) -> GroupResult<PrivKey> {
        self.keys
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GroupError::UnknownGroupId(id.to_string()))
    }

    /// Sign `bytes` with `key`.
    pub fn sign(&self, key: &PrivKey, bytes: &[u8]) -> GroupResult<Vec<u8>> {
        Ok(key.sign(bytes))
    }

    /// Verify `signature` over `data`.
    ///
    /// A well-formed signature that does not match yields
    /// [`GroupError::SignatureInvalid`]; malformed signature bytes yield
    /// [`GroupError::Crypto`].
    pub fn verify(&self, signature: &[u8], public: &PubKey, data: &[u8]) -> GroupResult<()> {
        if public.verify(data, signature)? {
            Ok(())
        } else {
            Err(GroupError::SignatureInvalid(format!(
                "log entry signature does not match key {}",
                public
            )))
        }
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether no key is registered.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_key() {
        let store = SignedEntryKeyStore::new();
        let key = PrivKey::generate();
        let id = store.set_key(key.clone());

        assert_eq!(id, hex::encode(key.public().as_bytes()));
        assert!(store.has_key(&id));
        assert_eq!(store.get_key(&id).unwrap().public(), key.public());
        assert_eq!(store.create_key(&id).unwrap().public(), key.public());
    }

    #[test]
    fn test_unknown_key() {
        let store = SignedEntryKeyStore::new();
        assert!(!store.has_key("deadbeef"));
        assert!(matches!(
            store.get_key("deadbeef"),
            Err(GroupError::UnknownGroupId(_))
        ));
    }

    #[test]
    fn test_sign_verify() {
        let store = SignedEntryKeyStore::new();
        let key = PrivKey::generate();
        let sig = store.sign(&key, b"entry bytes").unwrap();

        store.verify(&sig, &key.public(), b"entry bytes").unwrap();
    }

    #[test]
    fn test_verify_distinguishes_mismatch_from_malformed() {
        let store = SignedEntryKeyStore::new();
        let key = PrivKey::generate();
        let sig = store.sign(&key, b"entry bytes").unwrap();

        let mismatch = store.verify(&sig, &key.public(), b"other bytes");
        assert!(matches!(mismatch, Err(GroupError::SignatureInvalid(_))));

        let malformed = store.verify(&sig[..10], &key.public(), b"entry bytes");
        assert!(matches!(malformed, Err(GroupError::Crypto(_))));
    }
}
