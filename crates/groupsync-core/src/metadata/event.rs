//! Metadata log event payloads
//!
//! Keys travel as raw bytes and are decoded by the index handlers, so a
//! malformed key surfaces as a per-entry `Deserialization` failure rather than
//! a failure to decode the whole entry.

use serde::{Deserialize, Serialize};

use crate::crypto::SealedSecret;
use crate::error::{GroupError, GroupResult};
use crate::invitation::InvitationProof;
use crate::message::ChainId;

/// Group creator announcing itself as the first member and admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMemberAnnounced {
    pub member_pk: Vec<u8>,
    pub device_pk: Vec<u8>,
    /// Member signature authorizing the device
    pub member_sig: Vec<u8>,
    /// Group key signature over the member key
    pub group_sig: Vec<u8>,
}

/// A device joining under a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDeviceAdded {
    pub member_pk: Vec<u8>,
    pub device_pk: Vec<u8>,
    /// Member signature authorizing the device
    pub member_sig: Vec<u8>,
    /// Present when the member joined through an invitation
    pub invitation: Option<InvitationProof>,
}

/// A device chain key sealed for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSecretAdded {
    /// Device whose chain key is shared (the sender)
    pub device_pk: Vec<u8>,
    pub dest_member_pk: Vec<u8>,
    /// Epoch of the sealed chain, readable by every member
    pub chain_id: ChainId,
    pub secret: SealedSecret,
}

/// Admin role granted to an existing member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRoleGranted {
    pub member_pk: Vec<u8>,
}

/// Payload of one metadata log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMetadataEvent {
    InitialMemberAnnounced(InitialMemberAnnounced),
    MemberDeviceAdded(MemberDeviceAdded),
    DeviceSecretAdded(DeviceSecretAdded),
    AdminRoleGranted(AdminRoleGranted),
}

impl GroupMetadataEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GroupMetadataEvent::InitialMemberAnnounced(_) => "initial_member_announced",
            GroupMetadataEvent::MemberDeviceAdded(_) => "member_device_added",
            GroupMetadataEvent::DeviceSecretAdded(_) => "device_secret_added",
            GroupMetadataEvent::AdminRoleGranted(_) => "admin_role_granted",
        }
    }

    pub fn encode(&self) -> GroupResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| GroupError::Serialization(format!("failed to encode metadata event: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> GroupResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| GroupError::Deserialization(format!("failed to decode metadata event: {}", e)))
    }
}
