//! Signed and encrypted log entry envelopes
//!
//! A `GroupEnvelope` carries one log entry payload. It uses
//! **Encrypt-then-Sign**:
//! 1. Encrypt the payload with the group's shared key (ChaCha20-Poly1305)
//! 2. Sign the envelope fields with the authoring device key
//!
//! The signature covers the group id, so an envelope lifted from one group's
//! log does not open in another.
//!
//! ## Wire Format
//!
//! ```text
//! +----------+--------+-------+-------+------------+-----------+
//! | version  | sender | clock | nonce | ciphertext | signature |
//! | (1 byte) |  (32)  |  (8)  | (12)  | (variable) |   (64)    |
//! +----------+--------+-------+-------+------------+-----------+
//! ```
//!
//! `clock` is the authoring device's append counter; together with the sender
//! it makes every envelope unique even for identical payloads.

use serde::{Deserialize, Serialize};

use crate::crypto::{SecretBox, KEY_SIZE, NONCE_SIZE};
use crate::error::{GroupError, GroupResult};
use crate::group::GroupId;
use crate::identity::PubKey;

/// Current envelope protocol version
pub const ENVELOPE_VERSION: u8 = 1;

/// A signed and encrypted wrapper for one log entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEnvelope {
    /// Protocol version for forward compatibility
    pub version: u8,

    /// Authoring device key
    pub sender: PubKey,

    /// Per-device append counter
    pub clock: u64,

    /// Nonce used for encryption
    pub nonce: [u8; NONCE_SIZE],

    /// Encrypted payload
    pub ciphertext: Vec<u8>,

    /// Signature over (version || group id || sender || clock || nonce || ciphertext)
    pub signature: Vec<u8>,
}

impl GroupEnvelope {
    /// Encrypt `payload` under `key` and sign the result with `sign_fn`.
    ///
    /// # Errors
    ///
    /// Returns `GroupError::Crypto` if encryption fails, or whatever `sign_fn`
    /// returns. No envelope exists unless it is fully signed.
    pub fn seal(
        payload: &[u8],
        group_id: &GroupId,
        sender: PubKey,
        clock: u64,
        key: &[u8; KEY_SIZE],
        sign_fn: impl FnOnce(&[u8]) -> GroupResult<Vec<u8>>,
    ) -> GroupResult<Self> {
        let nonce = SecretBox::generate_nonce();
        let ciphertext = SecretBox::new(key).encrypt_with_nonce(payload, &nonce)?;

        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            sender,
            clock,
            nonce,
            ciphertext,
            signature: Vec::new(),
        };

        let signed_data = envelope.signed_data(group_id);
        envelope.signature = sign_fn(&signed_data)?;

        Ok(envelope)
    }

    /// Verify the signature with `verify_fn`, then decrypt.
    ///
    /// # Errors
    ///
    /// - `GroupError::EnvelopeVersionUnsupported` if version is unknown
    /// - whatever `verify_fn` returns (normally `SignatureInvalid` or `Crypto`)
    /// - `GroupError::DecryptionFailed` if decryption fails
    pub fn open(
        &self,
        group_id: &GroupId,
        key: &[u8; KEY_SIZE],
        verify_fn: impl FnOnce(&PubKey, &[u8], &[u8]) -> GroupResult<()>,
    ) -> GroupResult<Vec<u8>> {
        self.verify(group_id, verify_fn)?;
        SecretBox::new(key).decrypt_with_nonce(&self.ciphertext, &self.nonce)
    }

    /// Check version and signature without decrypting.
    pub fn verify(
        &self,
        group_id: &GroupId,
        verify_fn: impl FnOnce(&PubKey, &[u8], &[u8]) -> GroupResult<()>,
    ) -> GroupResult<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(GroupError::EnvelopeVersionUnsupported(self.version));
        }
        verify_fn(&self.sender, &self.signed_data(group_id), &self.signature)
    }

    fn signed_data(&self, group_id: &GroupId) -> Vec<u8> {
        let mut data = Vec::with_capacity(1 + 32 + 32 + 8 + NONCE_SIZE + 4 + self.ciphertext.len());

        data.push(self.version);
        data.extend_from_slice(group_id.as_bytes());
        data.extend_from_slice(self.sender.as_bytes());
        data.extend_from_slice(&self.clock.to_le_bytes());
        data.extend_from_slice(&self.nonce);

        data.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.ciphertext);

        data
    }

    /// Encode the envelope with postcard.
    pub fn to_bytes(&self) -> GroupResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| GroupError::Serialization(format!("failed to encode envelope: {}", e)))
    }

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// Returns `GroupError::Deserialization` if the bytes are malformed.
    pub fn from_bytes(bytes: &[u8]) -> GroupResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| GroupError::Deserialization(format!("failed to decode envelope: {}", e)))
    }
}
