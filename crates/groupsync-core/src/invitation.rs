//! Invitation tokens and member-join proofs
//!
//! An existing member issues an [`Invitation`]: a one-off invitation key, the
//! group (public key and shared key), and the inviter's signature over the
//! invitation key. Redeeming it produces an [`InvitationProof`] that travels
//! inside the `MemberDeviceAdded` metadata event:
//!
//! ```text
//! inviter member ──signs──▶ invitation pk ──signs──▶ new member pk ──signs──▶ device pk
//! ```
//!
//! Every link is bound to the group id so a proof cannot be replayed into
//! another group. [`InvitationProof::verify`] only checks the signatures; the
//! metadata index additionally requires the inviter to be a member, and holds
//! the entry back until the inviter's own join has been replayed.
//!
//! Tokens are encoded as `group-invite:{base58}` strings for sharing.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::KEY_SIZE;
use crate::error::{GroupError, GroupResult};
use crate::group::{Group, GroupId};
use crate::identity::{PrivKey, PubKey};

/// Prefix for encoded invitation strings
const INVITE_PREFIX: &str = "group-invite:";

/// Current invitation format version
const INVITATION_VERSION: u8 = 1;

const INVITER_CONTEXT: &[u8] = b"groupsync-invitation";
const REDEEM_CONTEXT: &[u8] = b"groupsync-invitation-redeem";
const DEVICE_CONTEXT: &[u8] = b"groupsync-member-device";
const INITIAL_MEMBER_CONTEXT: &[u8] = b"groupsync-initial-member";

/// A sealed invitation to join a group.
#[derive(Clone, Serialize, Deserialize)]
pub struct Invitation {
    version: u8,
    group_pk: PubKey,
    group_shared_key: [u8; KEY_SIZE],
    inviter: PubKey,
    invitation_seed: [u8; 32],
    inviter_sig: Vec<u8>,
}

impl Invitation {
    /// Issue an invitation to `group` signed by `inviter`.
    pub fn new(inviter: &PrivKey, group: &Group) -> Self {
        let invitation_key = PrivKey::generate();
        let inviter_sig = inviter.sign(&inviter_data(&group.id(), &invitation_key.public()));

        Self {
            version: INVITATION_VERSION,
            group_pk: *group.pub_key(),
            group_shared_key: *group.shared_key(),
            inviter: inviter.public(),
            invitation_seed: invitation_key.to_bytes(),
            inviter_sig,
        }
    }

    /// The group this invitation grants access to.
    pub fn group(&self) -> Group {
        Group::from_parts(self.group_pk, self.group_shared_key)
    }

    /// Member key of the inviter.
    pub fn inviter(&self) -> &PubKey {
        &self.inviter
    }

    /// Public half of the invitation key.
    pub fn invitation_pub_key(&self) -> GroupResult<PubKey> {
        Ok(PrivKey::from_bytes(&self.invitation_seed)?.public())
    }

    /// Check the inviter signature and format version.
    pub fn validate(&self) -> GroupResult<()> {
        if self.version != INVITATION_VERSION {
            return Err(GroupError::InvalidInvitation(format!(
                "unsupported invitation version {}",
                self.version
            )));
        }
        let invitation_pk = self.invitation_pub_key()?;
        let data = inviter_data(&GroupId::from(&self.group_pk), &invitation_pk);
        if !self.inviter.verify(&data, &self.inviter_sig).unwrap_or(false) {
            return Err(GroupError::InvalidInvitation(
                "inviter signature does not verify".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the proof that `member` joined through this invitation with `device`.
    pub fn redeem(&self, member: &PrivKey, device: &PubKey) -> GroupResult<InvitationProof> {
        self.validate()?;
        let group_id = GroupId::from(&self.group_pk);
        let invitation_key = PrivKey::from_bytes(&self.invitation_seed)?;

        Ok(InvitationProof {
            inviter: self.inviter,
            invitation_pk: invitation_key.public(),
            inviter_sig: self.inviter_sig.clone(),
            invitation_sig: invitation_key.sign(&redeem_data(&group_id, &member.public())),
            member_sig: member.sign(&device_data(&group_id, device)),
        })
    }

    /// Encode as a `group-invite:{base58}` string.
    pub fn encode(&self) -> GroupResult<String> {
        let bytes = postcard::to_stdvec(self)
            .map_err(|e| GroupError::Serialization(format!("failed to encode invitation: {}", e)))?;
        Ok(format!("{}{}", INVITE_PREFIX, bs58::encode(&bytes).into_string()))
    }

    /// Decode a `group-invite:{base58}` string and validate it.
    pub fn decode(s: &str) -> GroupResult<Self> {
        let data = s.strip_prefix(INVITE_PREFIX).ok_or_else(|| {
            GroupError::InvalidInvitation(format!(
                "invalid prefix: expected '{}', got '{}'",
                INVITE_PREFIX,
                s.chars().take(13).collect::<String>()
            ))
        })?;

        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|e| GroupError::InvalidInvitation(format!("invalid base58: {}", e)))?;

        let invitation: Invitation = postcard::from_bytes(&bytes)
            .map_err(|e| GroupError::InvalidInvitation(format!("invalid invitation data: {}", e)))?;

        invitation.validate()?;
        Ok(invitation)
    }
}

impl Drop for Invitation {
    fn drop(&mut self) {
        self.group_shared_key.zeroize();
        self.invitation_seed.zeroize();
    }
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("group", &GroupId::from(&self.group_pk))
            .field("inviter", &self.inviter)
            .finish_non_exhaustive()
    }
}

/// Signature chain proving a member joined through an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationProof {
    pub inviter: PubKey,
    pub invitation_pk: PubKey,
    pub inviter_sig: Vec<u8>,
    pub invitation_sig: Vec<u8>,
    pub member_sig: Vec<u8>,
}

impl InvitationProof {
    /// Verify every link of the proof for `member` and `device` in `group_id`.
    pub fn verify(&self, group_id: &GroupId, member: &PubKey, device: &PubKey) -> GroupResult<()> {
        let links = [
            (
                &self.inviter,
                inviter_data(group_id, &self.invitation_pk),
                &self.inviter_sig,
                "inviter",
            ),
            (
                &self.invitation_pk,
                redeem_data(group_id, member),
                &self.invitation_sig,
                "invitation",
            ),
            (member, device_data(group_id, device), &self.member_sig, "member"),
        ];

        for (signer, data, signature, link) in links {
            if !signer.verify(&data, signature).unwrap_or(false) {
                return Err(GroupError::InvalidInvitation(format!(
                    "{} signature does not verify",
                    link
                )));
            }
        }
        Ok(())
    }
}

/// Member signature authorizing `device` inside `group_id`.
pub fn sign_member_device(group_id: &GroupId, member: &PrivKey, device: &PubKey) -> Vec<u8> {
    member.sign(&device_data(group_id, device))
}

/// Verify a member signature produced by [`sign_member_device`].
pub fn verify_member_device(
    group_id: &GroupId,
    member: &PubKey,
    device: &PubKey,
    signature: &[u8],
) -> GroupResult<()> {
    if member.verify(&device_data(group_id, device), signature)? {
        Ok(())
    } else {
        Err(GroupError::SignatureInvalid(format!(
            "member {} did not authorize device {}",
            member, device
        )))
    }
}

/// Group key signature naming `member` as the group's initial member.
pub fn sign_initial_member(group_key: &PrivKey, member: &PubKey) -> Vec<u8> {
    let group_id = GroupId::from(&group_key.public());
    group_key.sign(&bound_data(INITIAL_MEMBER_CONTEXT, &group_id, member))
}

/// Verify a signature produced by [`sign_initial_member`].
pub fn verify_initial_member(group_pk: &PubKey, member: &PubKey, signature: &[u8]) -> GroupResult<()> {
    let data = bound_data(INITIAL_MEMBER_CONTEXT, &GroupId::from(group_pk), member);
    if group_pk.verify(&data, signature)? {
        Ok(())
    } else {
        Err(GroupError::SignatureInvalid(format!(
            "{} was not announced by the group key",
            member
        )))
    }
}

fn bound_data(context: &[u8], group_id: &GroupId, key: &PubKey) -> Vec<u8> {
    let mut data = Vec::with_capacity(context.len() + 64);
    data.extend_from_slice(context);
    data.extend_from_slice(group_id.as_bytes());
    data.extend_from_slice(key.as_bytes());
    data
}

fn inviter_data(group_id: &GroupId, invitation_pk: &PubKey) -> Vec<u8> {
    bound_data(INVITER_CONTEXT, group_id, invitation_pk)
}

fn redeem_data(group_id: &GroupId, member: &PubKey) -> Vec<u8> {
    bound_data(REDEEM_CONTEXT, group_id, member)
}

fn device_data(group_id: &GroupId, device: &PubKey) -> Vec<u8> {
    bound_data(DEVICE_CONTEXT, group_id, device)
}
