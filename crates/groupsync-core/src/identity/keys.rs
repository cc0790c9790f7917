//! Ed25519 key wrappers
//!
//! [`PrivKey`] and [`PubKey`] wrap `ed25519-dalek` keys and give them the
//! properties the protocol relies on: hashing and ordering by raw bytes, serde
//! as raw bytes, and X25519 interop for sealing secrets.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::error::{GroupError, GroupResult};

/// Size of a raw Ed25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Key id used by the keystore: hex of the raw public key bytes.
pub fn key_id(public: &PubKey) -> String {
    hex::encode(public.as_bytes())
}

/// Private signing key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivKey(SigningKey);

impl PrivKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self(key)
    }

    /// Restore a key from its 32-byte seed.
    pub fn from_bytes(bytes: &[u8]) -> GroupResult<Self> {
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            GroupError::Deserialization(format!(
                "private key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(SigningKey::from_bytes(&seed)))
    }

    /// The 32-byte seed of this key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The public half of this key.
    pub fn public(&self) -> PubKey {
        PubKey(self.0.verifying_key())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_bytes().to_vec()
    }

    /// X25519 secret for key agreement, derived from the same seed.
    pub fn to_x25519(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.0.to_scalar_bytes())
    }
}

impl fmt::Debug for PrivKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivKey")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Public verification key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PubKey(VerifyingKey);

impl PubKey {
    /// Decode a raw 32-byte public key.
    ///
    /// Fails with [`GroupError::Deserialization`] on a wrong length or a
    /// point that is not on the curve.
    pub fn from_bytes(bytes: &[u8]) -> GroupResult<Self> {
        let raw: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            GroupError::Deserialization(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|e| GroupError::Deserialization(format!("invalid public key: {}", e)))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Raw key bytes as an owned vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Verify a signature over `message`.
    ///
    /// Returns `Ok(false)` when the signature does not match and an error
    /// when the signature bytes are malformed.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> GroupResult<bool> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| GroupError::Crypto(format!("malformed signature: {}", e)))?;
        Ok(self.0.verify(message, &signature).is_ok())
    }

    /// X25519 public key for sealing secrets to the holder of this key.
    pub fn to_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0.to_montgomery().to_bytes())
    }

    /// Short hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..6])
    }
}

impl Hash for PubKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl PartialOrd for PubKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PubKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(self.as_bytes()))
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <[u8; PUBLIC_KEY_SIZE]>::deserialize(deserializer)?;
        PubKey::from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = PrivKey::generate();
        let b = PrivKey::generate();
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn test_priv_key_roundtrip() {
        let key = PrivKey::generate();
        let restored = PrivKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(key.public(), restored.public());
    }

    #[test]
    fn test_pub_key_wrong_length() {
        let result = PubKey::from_bytes(&[1, 2, 3]);
        assert!(matches!(result, Err(GroupError::Deserialization(_))));
    }

    #[test]
    fn test_malformed_signature_is_error() {
        let key = PrivKey::generate();
        let result = key.public().verify(b"data", &[0u8; 10]);
        assert!(matches!(result, Err(GroupError::Crypto(_))));
    }

    #[test]
    fn test_tampered_message_is_false() {
        let key = PrivKey::generate();
        let sig = key.sign(b"original");
        assert!(!key.public().verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn test_x25519_agreement_matches() {
        let alice = PrivKey::generate();
        let bob = PrivKey::generate();

        let ab = alice.to_x25519().diffie_hellman(&bob.public().to_x25519());
        let ba = bob.to_x25519().diffie_hellman(&alice.public().to_x25519());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_serde_as_raw_bytes() {
        let key = PrivKey::generate().public();
        let bytes = postcard::to_allocvec(&key).unwrap();
        let decoded: PubKey = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_ordering_by_bytes() {
        let mut keys: Vec<PubKey> = (0..5).map(|_| PrivKey::generate().public()).collect();
        keys.sort();
        for pair in keys.windows(2) {
            assert!(pair[0].as_bytes() <= pair[1].as_bytes());
        }
    }
}
