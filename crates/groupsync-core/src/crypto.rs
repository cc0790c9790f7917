//! Symmetric encryption, key derivation and sealed secrets
//!
//! - [`SecretBox`]: ChaCha20-Poly1305 AEAD keyed by a 32-byte secret (the
//!   group's shared key, or a per-message key from the device ratchet)
//! - [`derive_key`]: HKDF-SHA256 expansion with a domain label
//! - [`SealedSecret`]: a secret encrypted for one member through an ephemeral
//!   X25519 agreement with the member's key
//!
//! ## Wire Format
//!
//! `SecretBox::encrypt` output: `[nonce (12 bytes)] + [ciphertext + tag (16 bytes)]`

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::Zeroize;

use crate::error::{GroupError, GroupResult};
use crate::identity::{PrivKey, PubKey};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Size of every symmetric key in the protocol
pub const KEY_SIZE: usize = 32;

/// Domain separation for sealed secrets
const SEAL_INFO: &[u8] = b"groupsync-sealed-secret-v1";

/// ChaCha20-Poly1305 cipher bound to one key.
pub struct SecretBox {
    cipher: ChaCha20Poly1305,
}

impl SecretBox {
    /// Create a cipher for the given 32-byte key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with a fresh random nonce prepended to the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> GroupResult<Vec<u8>> {
        let nonce = Self::generate_nonce();
        let ciphertext = self.encrypt_with_nonce(plaintext, &nonce)?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`SecretBox::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> GroupResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(GroupError::DecryptionFailed(
                "data too short to contain nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);
        self.decrypt_with_nonce(ciphertext, &nonce_bytes)
    }

    /// Encrypt with a caller-provided nonce; the nonce is not prepended.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> GroupResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| GroupError::Crypto(format!("encryption failed: {}", e)))
    }

    /// Decrypt with a caller-provided nonce.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> GroupResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| GroupError::DecryptionFailed(format!("{}", e)))
    }
}

/// Derive a 32-byte key from input key material using HKDF-SHA256.
pub fn derive_key(ikm: &[u8], info: &[u8]) -> GroupResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut output = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut output)
        .map_err(|e| GroupError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(output)
}

/// A secret sealed for a single destination member.
///
/// The sender generates an ephemeral X25519 key, agrees with the member's
/// X25519 form of their Ed25519 key, and encrypts the secret under the HKDF
/// output. Only the destination member key can open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Ephemeral X25519 public key
    pub ephemeral_pk: [u8; 32],
    /// Nonce + ciphertext of the secret
    pub ciphertext: Vec<u8>,
}

impl SealedSecret {
    /// Seal `secret` for the holder of `recipient`.
    pub fn seal(secret: &[u8], recipient: &PubKey) -> GroupResult<Self> {
        let mut ephemeral_seed = [0u8; 32];
        rand::rng().fill_bytes(&mut ephemeral_seed);
        let ephemeral_secret = X25519StaticSecret::from(ephemeral_seed);
        ephemeral_seed.zeroize();
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&recipient.to_x25519());
        let mut key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient)?;
        let ciphertext = SecretBox::new(&key).encrypt(secret);
        key.zeroize();

        Ok(Self {
            ephemeral_pk: *ephemeral_public.as_bytes(),
            ciphertext: ciphertext?,
        })
    }

    /// Open the secret with the destination member's private key.
    pub fn open(&self, recipient: &PrivKey) -> GroupResult<Vec<u8>> {
        let ephemeral_public = X25519PublicKey::from(self.ephemeral_pk);
        let shared = recipient.to_x25519().diffie_hellman(&ephemeral_public);
        let mut key = seal_key(shared.as_bytes(), &self.ephemeral_pk, &recipient.public())?;
        let plaintext = SecretBox::new(&key).decrypt(&self.ciphertext);
        key.zeroize();
        plaintext
    }
}

fn seal_key(shared: &[u8], ephemeral_pk: &[u8; 32], recipient: &PubKey) -> GroupResult<[u8; KEY_SIZE]> {
    let mut info = Vec::with_capacity(SEAL_INFO.len() + 64);
    info.extend_from_slice(SEAL_INFO);
    info.extend_from_slice(ephemeral_pk);
    info.extend_from_slice(recipient.as_bytes());
    derive_key(shared, &info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SecretBox::generate_key();
        let cipher = SecretBox::new(&key);

        let ciphertext = cipher.encrypt(b"Hello, group!").unwrap();
        assert!(ciphertext.len() >= 13 + NONCE_SIZE + 16);
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), b"Hello, group!");
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = SecretBox::new(&SecretBox::generate_key())
            .encrypt(b"Secret")
            .unwrap();
        let result = SecretBox::new(&SecretBox::generate_key()).decrypt(&ciphertext);
        assert!(matches!(result, Err(GroupError::DecryptionFailed(_))));
    }

    #[test]
    fn test_truncated_data_fails() {
        let cipher = SecretBox::new(&SecretBox::generate_key());
        let result = cipher.decrypt(&[0u8; 5]);
        match result {
            Err(GroupError::DecryptionFailed(msg)) => assert!(msg.contains("too short")),
            other => panic!("expected DecryptionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_derive_key_domain_separation() {
        let a = derive_key(b"ikm", b"one").unwrap();
        let b = derive_key(b"ikm", b"two").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, derive_key(b"ikm", b"one").unwrap());
    }

    #[test]
    fn test_sealed_secret_opens_for_recipient_only() {
        let recipient = PrivKey::generate();
        let other = PrivKey::generate();

        let sealed = SealedSecret::seal(b"chain key material", &recipient.public()).unwrap();
        assert_eq!(sealed.open(&recipient).unwrap(), b"chain key material");
        assert!(sealed.open(&other).is_err());
    }
}
