//! Metadata store: operations appending to the metadata log
//!
//! Appends are checked against the local index first and fail fast; the
//! index itself only changes once the entry comes back from the log.

use std::sync::Arc;

use tracing::info;

use super::event::{
    AdminRoleGranted, DeviceSecretAdded, GroupMetadataEvent, InitialMemberAnnounced,
    MemberDeviceAdded,
};
use super::index::{MetadataStoreIndex, UpdateSummary};
use crate::crypto::SealedSecret;
use crate::error::{GroupError, GroupResult};
use crate::group::{Group, OwnMemberDevice};
use crate::identity::{PrivKey, PubKey};
use crate::invitation::{sign_initial_member, sign_member_device};
use crate::log::{EntryRef, GroupLogBinding};
use crate::message::MessageKeys;

/// Append side of a group's metadata log.
#[derive(Clone)]
pub struct MetadataStore {
    group: Arc<Group>,
    binding: Arc<GroupLogBinding>,
    own: Arc<OwnMemberDevice>,
    keys: Arc<MessageKeys>,
    index: Arc<MetadataStoreIndex>,
}

impl MetadataStore {
    pub fn new(
        group: Arc<Group>,
        binding: Arc<GroupLogBinding>,
        own: Arc<OwnMemberDevice>,
        keys: Arc<MessageKeys>,
        index: Arc<MetadataStoreIndex>,
    ) -> Self {
        Self {
            group,
            binding,
            own,
            keys,
            index,
        }
    }

    pub fn index(&self) -> &Arc<MetadataStoreIndex> {
        &self.index
    }

    /// Replay every committed entry into the index.
    pub async fn refresh(&self) -> GroupResult<UpdateSummary> {
        let entries = self.binding.list_entries().await?;
        Ok(self.index.update_index(&entries))
    }

    /// Announce the local member as the group's first member and admin.
    ///
    /// `group_key` is the group's private key, held by its creator.
    pub async fn announce_initial_member(&self, group_key: &PrivKey) -> GroupResult<EntryRef> {
        if &group_key.public() != self.group.pub_key() {
            return Err(GroupError::InvalidInput(
                "key does not belong to this group".to_string(),
            ));
        }

        let own = self.own.public();
        let event = GroupMetadataEvent::InitialMemberAnnounced(InitialMemberAnnounced {
            member_pk: own.member.to_bytes(),
            device_pk: own.device.to_bytes(),
            member_sig: sign_member_device(&self.group.id(), self.own.member(), &own.device),
            group_sig: sign_initial_member(group_key, &own.member),
        });

        let entry_ref = self.append(&event).await?;
        info!(group = %self.group.id(), member = %own.member, "Announced initial member");
        Ok(entry_ref)
    }

    /// Register the local device under the local member.
    ///
    /// The member must already be in the group through another of its
    /// devices; new members join with an invitation instead.
    pub async fn add_device_to_group(&self) -> GroupResult<EntryRef> {
        let own = self.own.public();
        self.index.get_devices_for_member(&own.member)?;
        let event = GroupMetadataEvent::MemberDeviceAdded(MemberDeviceAdded {
            member_pk: own.member.to_bytes(),
            device_pk: own.device.to_bytes(),
            member_sig: sign_member_device(&self.group.id(), self.own.member(), &own.device),
            invitation: None,
        });
        self.append(&event).await
    }

    /// Seal the local device chain key for `dest_member` and append it.
    ///
    /// Fails if the current chain was already sent to that member; a new
    /// chain (after a restart without the old one) can be sent again.
    pub async fn send_secret(&self, dest_member: &PubKey) -> GroupResult<EntryRef> {
        self.index.get_devices_for_member(dest_member)?;
        if self.index.are_secrets_already_sent(dest_member) {
            return Err(GroupError::InvalidInput(format!(
                "secret already sent to {}",
                dest_member
            )));
        }

        let chain = self.keys.own_device_chain_key();
        let secret = SealedSecret::seal(&chain.to_bytes()?, dest_member)?;
        let event = GroupMetadataEvent::DeviceSecretAdded(DeviceSecretAdded {
            device_pk: self.own.device().public().to_bytes(),
            dest_member_pk: dest_member.to_bytes(),
            chain_id: chain.chain_id(),
            secret,
        });

        let entry_ref = self.append(&event).await?;
        info!(
            group = %self.group.id(),
            dest = %dest_member,
            chain = chain.chain_id(),
            counter = chain.counter(),
            "Sent device secret"
        );
        Ok(entry_ref)
    }

    /// Grant the admin role to an existing member.
    pub async fn grant_admin_role(&self, member: &PubKey) -> GroupResult<EntryRef> {
        let own_member = self.own.member().public();
        if !self.index.is_admin(&own_member) {
            return Err(GroupError::NotAdmin(own_member.to_string()));
        }
        self.index.get_devices_for_member(member)?;

        let event = GroupMetadataEvent::AdminRoleGranted(AdminRoleGranted {
            member_pk: member.to_bytes(),
        });
        self.append(&event).await
    }

    async fn append(&self, event: &GroupMetadataEvent) -> GroupResult<EntryRef> {
        self.binding.append(self.own.device(), &event.encode()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::events::EventEmitter;
    use crate::invitation::Invitation;
    use crate::keystore::SignedEntryKeyStore;
    use crate::log::{LogKind, MemoryLog};

    fn store(group: &Arc<Group>, log: Arc<MemoryLog>) -> MetadataStore {
        let own = Arc::new(OwnMemberDevice::generate());
        let binding = Arc::new(
            GroupLogBinding::new(
                group,
                LogKind::Metadata,
                log,
                Arc::new(SignedEntryKeyStore::new()),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let keys = Arc::new(MessageKeys::new(own.device().public(), 64));
        let index = Arc::new(MetadataStoreIndex::new(
            group.clone(),
            binding.clone(),
            own.clone(),
            keys.clone(),
            EventEmitter::new(16),
        ));
        MetadataStore::new(group.clone(), binding, own, keys, index)
    }

    #[tokio::test]
    async fn test_announce_then_refresh() {
        let (group, group_key) = Group::generate();
        let group = Arc::new(group);
        let store = store(&group, Arc::new(MemoryLog::new()));

        store.announce_initial_member(&group_key).await.unwrap();
        let summary = store.refresh().await.unwrap();
        assert_eq!(summary.applied, 1);

        let own_member = store.own.member().public();
        assert!(store.index().is_admin(&own_member));
        assert_eq!(store.index().device_count(), 1);
    }

    #[tokio::test]
    async fn test_announce_with_wrong_group_key() {
        let (group, _) = Group::generate();
        let store = store(&Arc::new(group), Arc::new(MemoryLog::new()));
        let result = store.announce_initial_member(&PrivKey::generate()).await;
        assert!(matches!(result, Err(GroupError::InvalidInput(_))));
    }

    async fn join(store: &MetadataStore, inviter: &MetadataStore) {
        let invitation = Invitation::new(inviter.own.member(), &store.group);
        let own = store.own.public();
        let event = GroupMetadataEvent::MemberDeviceAdded(MemberDeviceAdded {
            member_pk: own.member.to_bytes(),
            device_pk: own.device.to_bytes(),
            member_sig: sign_member_device(&store.group.id(), store.own.member(), &own.device),
            invitation: Some(invitation.redeem(store.own.member(), &own.device).unwrap()),
        });
        store.append(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_secret_between_members() {
        let (group, group_key) = Group::generate();
        let group = Arc::new(group);
        let log = Arc::new(MemoryLog::new());
        let alice = store(&group, log.clone());
        let bob = store(&group, log);

        alice.announce_initial_member(&group_key).await.unwrap();
        join(&bob, &alice).await;
        alice.refresh().await.unwrap();

        let bob_member = bob.own.member().public();
        alice.send_secret(&bob_member).await.unwrap();

        alice.refresh().await.unwrap();
        bob.refresh().await.unwrap();

        assert!(alice.index().are_secrets_already_sent(&bob_member));
        assert!(bob.keys.has_chain(&alice.own.device().public(), alice.keys.own_chain_id()));

        // second send fails fast
        assert!(matches!(
            alice.send_secret(&bob_member).await,
            Err(GroupError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_add_device_requires_known_member() {
        let (group, _) = Group::generate();
        let store = store(&Arc::new(group), Arc::new(MemoryLog::new()));
        assert!(matches!(
            store.add_device_to_group().await,
            Err(GroupError::UnknownMember(_))
        ));
    }

    #[tokio::test]
    async fn test_send_secret_to_unknown_member() {
        let (group, _) = Group::generate();
        let store = store(&Arc::new(group), Arc::new(MemoryLog::new()));
        let result = store.send_secret(&PrivKey::generate().public()).await;
        assert!(matches!(result, Err(GroupError::UnknownMember(_))));
    }

    #[tokio::test]
    async fn test_grant_requires_admin() {
        let (group, group_key) = Group::generate();
        let group = Arc::new(group);
        let log = Arc::new(MemoryLog::new());
        let admin = store(&group, log.clone());
        let member = store(&group, log);

        admin.announce_initial_member(&group_key).await.unwrap();
        join(&member, &admin).await;
        member.refresh().await.unwrap();

        let member_pk = member.own.member().public();
        assert!(matches!(
            member.grant_admin_role(&member_pk).await,
            Err(GroupError::NotAdmin(_))
        ));

        admin.refresh().await.unwrap();
        admin.grant_admin_role(&member_pk).await.unwrap();
        admin.refresh().await.unwrap();
        assert!(admin.index().is_admin(&member_pk));
        assert_eq!(admin.index().list_admins().len(), 2);
    }
}
