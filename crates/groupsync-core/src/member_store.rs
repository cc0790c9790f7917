//! Member store: joining a group through an invitation

use std::sync::Arc;

use tracing::info;

use crate::error::{GroupError, GroupResult};
use crate::group::{Group, MemberDevice};
use crate::identity::PrivKey;
use crate::invitation::{sign_member_device, Invitation};
use crate::keystore::SignedEntryKeyStore;
use crate::log::{EntryRef, GroupLogBinding};
use crate::metadata::{GroupMetadataEvent, MemberDeviceAdded, StoreIndex};

/// Produces member-join entries on the metadata log.
#[derive(Clone)]
pub struct MemberStore {
    group: Arc<Group>,
    binding: Arc<GroupLogBinding>,
    keystore: Arc<SignedEntryKeyStore>,
    index: Arc<dyn StoreIndex>,
}

impl MemberStore {
    pub fn new(
        group: Arc<Group>,
        binding: Arc<GroupLogBinding>,
        keystore: Arc<SignedEntryKeyStore>,
        index: Arc<dyn StoreIndex>,
    ) -> Self {
        Self {
            group,
            binding,
            keystore,
            index,
        }
    }

    /// Join the group as `member` with `device`, proving authorization
    /// with `invitation`.
    ///
    /// The entry is signed by `device`, whose key is registered in the
    /// keystore first.
    pub async fn redeem_invitation(
        &self,
        member: &PrivKey,
        device: &PrivKey,
        invitation: &Invitation,
    ) -> GroupResult<EntryRef> {
        if invitation.group().id() != self.group.id() {
            return Err(GroupError::InvalidInvitation(format!(
                "invitation is for {}, not {}",
                invitation.group().id(),
                self.group.id()
            )));
        }

        let device_pk = device.public();
        let proof = invitation.redeem(member, &device_pk)?;
        let event = GroupMetadataEvent::MemberDeviceAdded(MemberDeviceAdded {
            member_pk: member.public().to_bytes(),
            device_pk: device_pk.to_bytes(),
            member_sig: sign_member_device(&self.group.id(), member, &device_pk),
            invitation: Some(proof),
        });

        self.keystore.set_key(device.clone());
        let entry_ref = self.binding.append(device, &event.encode()?).await?;

        info!(
            group = %self.group.id(),
            member = %member.public(),
            device = %device_pk,
            inviter = %invitation.inviter(),
            "Redeemed invitation"
        );
        Ok(entry_ref)
    }

    /// Current member/device pairs.
    pub fn list_members(&self) -> GroupResult<Vec<MemberDevice>> {
        self.index
            .get()
            .downcast::<Vec<MemberDevice>>()
            .map(|pairs| *pairs)
            .map_err(|_| GroupError::Internal("unexpected member index value type".to_string()))
    }
}
