//! Group identity, member/device pairs and the local member's keys

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecretBox, KEY_SIZE};
use crate::error::{GroupError, GroupResult};
use crate::identity::{PrivKey, PubKey};

/// Identifier of a group: the raw bytes of the group's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub [u8; 32]);

impl GroupId {
    /// Get the raw bytes of the GroupId
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to base58 string for display/storage
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> GroupResult<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| GroupError::InvalidInput(format!("invalid base58 group id: {}", e)))?;
        let raw: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            GroupError::InvalidInput(format!("group id must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(raw))
    }
}

impl From<&PubKey> for GroupId {
    fn from(key: &PubKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group_{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// A messaging context: public identity plus shared symmetric key.
///
/// The shared key encrypts metadata log payloads; it is zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Group {
    #[zeroize(skip)]
    pub_key: PubKey,
    shared_key: [u8; KEY_SIZE],
}

impl Group {
    /// Create a group with a fresh identity key and shared key.
    ///
    /// Returns the group and the private half of its identity key.
    pub fn generate() -> (Self, PrivKey) {
        let group_key = PrivKey::generate();
        let group = Self {
            pub_key: group_key.public(),
            shared_key: SecretBox::generate_key(),
        };
        (group, group_key)
    }

    /// Rebuild a group from its public key and shared key.
    pub fn from_parts(pub_key: PubKey, shared_key: [u8; KEY_SIZE]) -> Self {
        Self { pub_key, shared_key }
    }

    /// The group's public key.
    pub fn pub_key(&self) -> &PubKey {
        &self.pub_key
    }

    /// The group id derived from the public key.
    pub fn id(&self) -> GroupId {
        GroupId::from(&self.pub_key)
    }

    /// The shared symmetric key.
    pub fn shared_key(&self) -> &[u8; KEY_SIZE] {
        &self.shared_key
    }

    /// Cipher bound to the shared key.
    pub fn cipher(&self) -> SecretBox {
        SecretBox::new(&self.shared_key)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// A device registered under a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberDevice {
    pub member: PubKey,
    pub device: PubKey,
}

impl MemberDevice {
    pub fn new(member: PubKey, device: PubKey) -> Self {
        Self { member, device }
    }
}

/// Private keys of the local member and device for one group.
///
/// Both keys are zeroized when the value is dropped.
#[derive(Clone)]
pub struct OwnMemberDevice {
    member: PrivKey,
    device: PrivKey,
}

impl OwnMemberDevice {
    pub fn new(member: PrivKey, device: PrivKey) -> Self {
        Self { member, device }
    }

    /// Fresh member and device keys.
    pub fn generate() -> Self {
        Self::new(PrivKey::generate(), PrivKey::generate())
    }

    pub fn member(&self) -> &PrivKey {
        &self.member
    }

    pub fn device(&self) -> &PrivKey {
        &self.device
    }

    /// Public member/device pair.
    pub fn public(&self) -> MemberDevice {
        MemberDevice::new(self.member.public(), self.device.public())
    }
}

impl fmt::Debug for OwnMemberDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnMemberDevice")
            .field("member", &self.member.public())
            .field("device", &self.device.public())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_matches_pub_key() {
        let (group, group_key) = Group::generate();
        assert_eq!(group.id().as_bytes(), group_key.public().as_bytes());
        assert_eq!(group.pub_key(), &group_key.public());
    }

    #[test]
    fn test_group_id_base58_roundtrip() {
        let (group, _) = Group::generate();
        let id = group.id();
        assert_eq!(GroupId::from_base58(&id.to_base58()).unwrap(), id);
        assert!(id.to_string().starts_with("group_"));
        assert!(GroupId::from_base58("abc").is_err());
    }

    #[test]
    fn test_group_cipher_uses_shared_key() {
        let (group, _) = Group::generate();
        let copy = Group::from_parts(*group.pub_key(), *group.shared_key());
        let ciphertext = group.cipher().encrypt(b"metadata").unwrap();
        assert_eq!(copy.cipher().decrypt(&ciphertext).unwrap(), b"metadata");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let (group, _) = Group::generate();
        let debug = format!("{:?}", group);
        assert!(!debug.contains(&hex::encode(group.shared_key())));
    }

    #[test]
    fn test_own_member_device_public() {
        let own = OwnMemberDevice::generate();
        let pair = own.public();
        assert_eq!(pair.member, own.member().public());
        assert_eq!(pair.device, own.device().public());
        assert_ne!(pair.member, pair.device);
    }
}
