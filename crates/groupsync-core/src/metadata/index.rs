//! Metadata store index
//!
//! Replays the metadata log into the group's current state:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  members:        member pk -> [MemberDevice]                    │
//! │  devices:        device pk -> MemberDevice                      │
//! │  admins:         {member pk}                                    │
//! │  sent_secrets:   {(member pk, chain id)} this device sent       │
//! │  handled_events: {entry hash}                                   │
//! │  deferred:       entry hash -> entry waiting for a dependency   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Replay rules
//!
//! - An entry is applied at most once; its hash is recorded once it is
//!   applied or dropped.
//! - A failing entry (unreadable, bad signature, rule violation) is logged and
//!   its effects dropped. The batch always runs to the end.
//! - An entry that refers to a member, device or admin role not known yet is
//!   deferred instead. Deferred entries are retried at the end of every batch
//!   until none of them makes progress.
//! - Handlers validate everything before mutating, and every mutation is a
//!   set insertion, so replaying entries from independent devices in any
//!   interleaving that keeps each device's own order yields the same state.
//!
//! ## Locking
//!
//! State lives behind one reader/writer lock. `update_index` holds the write
//! guard for its whole batch and never awaits, so readers see either none or
//! all of a batch.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::event::{
    AdminRoleGranted, DeviceSecretAdded, GroupMetadataEvent, InitialMemberAnnounced,
    MemberDeviceAdded,
};
use crate::error::{GroupError, GroupResult};
use crate::events::{EventEmitter, GroupEvent, MetadataNotification};
use crate::group::{Group, MemberDevice, OwnMemberDevice};
use crate::identity::PubKey;
use crate::invitation::{verify_initial_member, verify_member_device};
use crate::log::{EntryHash, GroupLogBinding, LogEntry, OpenedEntry};
use crate::message::{ChainId, DeviceChainKey, MessageKeys};

/// Outcome counts of one `update_index` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Entries whose effects were applied
    pub applied: usize,
    /// Entries already handled earlier
    pub duplicates: usize,
    /// Secrets addressed to another member
    pub misdirected: usize,
    /// Entries dropped because they failed to open or to apply
    pub failed: usize,
    /// Entries still waiting for a dependency after the batch
    pub deferred: usize,
}

/// Index replaying a store's log.
pub trait StoreIndex: Send + Sync {
    /// Apply a batch of entries in delivery order.
    fn update_index(&self, entries: &[LogEntry]) -> UpdateSummary;

    /// Type-erased snapshot of the indexed value.
    fn get(&self) -> Box<dyn Any + Send>;
}

/// Comparable copy of the index state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub members: BTreeMap<PubKey, BTreeSet<PubKey>>,
    pub devices: BTreeMap<PubKey, PubKey>,
    pub admins: BTreeSet<PubKey>,
    pub sent_secrets: BTreeSet<(PubKey, ChainId)>,
    pub handled_events: BTreeSet<EntryHash>,
}

#[derive(Default)]
struct IndexState {
    members: HashMap<PubKey, Vec<MemberDevice>>,
    devices: HashMap<PubKey, MemberDevice>,
    admins: HashSet<PubKey>,
    sent_secrets: HashSet<(PubKey, ChainId)>,
    handled_events: HashSet<EntryHash>,
    deferred: BTreeMap<EntryHash, (OpenedEntry, GroupMetadataEvent)>,
}

enum Outcome {
    Applied,
    Deferred,
    Dropped,
}

/// Errors that may go away once more of the log has been replayed.
fn is_missing_dependency(error: &GroupError) -> bool {
    matches!(
        error,
        GroupError::UnknownMember(_) | GroupError::UnknownDevice(_) | GroupError::NotAdmin(_)
    )
}

impl IndexState {
    /// Fails if `device` is registered under another member; `Ok(false)` if
    /// it is already registered under `member`.
    fn check_device_free(&self, member: &PubKey, device: &PubKey) -> GroupResult<bool> {
        match self.devices.get(device) {
            None => Ok(true),
            Some(existing) if &existing.member == member => Ok(false),
            Some(existing) => Err(GroupError::Internal(format!(
                "device {} already registered under member {}",
                device, existing.member
            ))),
        }
    }

    fn register_device(&mut self, pair: MemberDevice) {
        self.devices.insert(pair.device, pair);
        self.members.entry(pair.member).or_default().push(pair);
    }
}

/// Membership, device, admin and secret state of one group.
pub struct MetadataStoreIndex {
    group: Arc<Group>,
    binding: Arc<GroupLogBinding>,
    own: Arc<OwnMemberDevice>,
    keys: Arc<MessageKeys>,
    emitter: EventEmitter,
    state: RwLock<IndexState>,
}

impl MetadataStoreIndex {
    pub fn new(
        group: Arc<Group>,
        binding: Arc<GroupLogBinding>,
        own: Arc<OwnMemberDevice>,
        keys: Arc<MessageKeys>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            group,
            binding,
            own,
            keys,
            emitter,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Apply a batch of metadata log entries.
    pub fn update_index(&self, entries: &[LogEntry]) -> UpdateSummary {
        let group_id = self.group.id();
        let mut summary = UpdateSummary::default();
        let mut state = self.state.write();

        for entry in entries {
            if state.handled_events.contains(&entry.hash) || state.deferred.contains_key(&entry.hash) {
                trace!(group = %group_id, entry = %entry.hash, "Entry already handled");
                summary.duplicates += 1;
                continue;
            }

            let (opened, event) = match self.open(entry) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(group = %group_id, entry = %entry.hash, error = %e, "Unable to open metadata entry");
                    summary.failed += 1;
                    continue;
                }
            };

            self.apply(&mut state, entry.hash, opened, event, &mut summary);
        }

        self.retry_deferred(&mut state, &mut summary);
        summary.deferred = state.deferred.len();
        summary
    }

    /// Retry deferred entries until a full pass applies or drops none of them.
    fn retry_deferred(&self, state: &mut IndexState, summary: &mut UpdateSummary) {
        loop {
            let waiting: Vec<EntryHash> = state.deferred.keys().copied().collect();
            let mut progressed = false;

            for hash in waiting {
                let Some((opened, event)) = state.deferred.remove(&hash) else {
                    continue;
                };
                match self.apply(state, hash, opened, event, summary) {
                    Outcome::Deferred => {}
                    Outcome::Applied | Outcome::Dropped => progressed = true,
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn apply(
        &self,
        state: &mut IndexState,
        hash: EntryHash,
        opened: OpenedEntry,
        event: GroupMetadataEvent,
        summary: &mut UpdateSummary,
    ) -> Outcome {
        let group_id = self.group.id();
        let result = match &event {
            GroupMetadataEvent::InitialMemberAnnounced(e) => self.handle_initial_member(state, &opened, e),
            GroupMetadataEvent::MemberDeviceAdded(e) => self.handle_member_device(state, e),
            GroupMetadataEvent::DeviceSecretAdded(e) => self.handle_device_secret(state, &opened, e),
            GroupMetadataEvent::AdminRoleGranted(e) => self.handle_admin_role(state, &opened, e),
        };

        match result {
            Ok(()) => {
                debug!(
                    group = %group_id,
                    entry = %hash,
                    device = %opened.sender,
                    kind = event.kind(),
                    "Applied metadata event"
                );
                state.handled_events.insert(hash);
                summary.applied += 1;
                self.emitter.emit(GroupEvent::Metadata(MetadataNotification {
                    entry: hash,
                    sender: opened.sender,
                    event,
                }));
                Outcome::Applied
            }
            Err(e) if is_missing_dependency(&e) => {
                trace!(group = %group_id, entry = %hash, kind = event.kind(), error = %e, "Deferred metadata event");
                state.deferred.insert(hash, (opened, event));
                Outcome::Deferred
            }
            Err(GroupError::SecretMisdirected(dest)) => {
                debug!(group = %group_id, entry = %hash, dest = %dest, "Secret addressed to another member");
                state.handled_events.insert(hash);
                summary.misdirected += 1;
                Outcome::Dropped
            }
            Err(e) => {
                warn!(
                    group = %group_id,
                    entry = %hash,
                    device = %opened.sender,
                    kind = event.kind(),
                    error = %e,
                    "Dropped metadata event"
                );
                state.handled_events.insert(hash);
                summary.failed += 1;
                Outcome::Dropped
            }
        }
    }

    fn open(&self, entry: &LogEntry) -> GroupResult<(OpenedEntry, GroupMetadataEvent)> {
        let opened = self.binding.open_entry(entry)?;
        let event = GroupMetadataEvent::decode(&opened.payload)?;
        Ok((opened, event))
    }

    fn handle_initial_member(
        &self,
        state: &mut IndexState,
        opened: &OpenedEntry,
        event: &InitialMemberAnnounced,
    ) -> GroupResult<()> {
        let member = PubKey::from_bytes(&event.member_pk)?;
        let device = PubKey::from_bytes(&event.device_pk)?;

        if opened.sender != device {
            return Err(GroupError::SignatureInvalid(format!(
                "initial member device {} did not author the announcement",
                device
            )));
        }
        verify_initial_member(self.group.pub_key(), &member, &event.group_sig)?;
        verify_member_device(&self.group.id(), &member, &device, &event.member_sig)?;

        if state.admins.contains(&member) {
            return Err(GroupError::Internal(format!(
                "member {} already announced",
                member
            )));
        }
        let is_new_device = state.check_device_free(&member, &device)?;

        state.admins.insert(member);
        if is_new_device {
            state.register_device(MemberDevice::new(member, device));
        }
        Ok(())
    }

    fn handle_member_device(&self, state: &mut IndexState, event: &MemberDeviceAdded) -> GroupResult<()> {
        let member = PubKey::from_bytes(&event.member_pk)?;
        let device = PubKey::from_bytes(&event.device_pk)?;

        let group_id = self.group.id();
        verify_member_device(&group_id, &member, &device, &event.member_sig)?;
        match &event.invitation {
            // a new member needs an invitation from an existing one
            Some(proof) => {
                proof.verify(&group_id, &member, &device)?;
                if !state.members.contains_key(&proof.inviter) {
                    return Err(GroupError::UnknownMember(proof.inviter.to_string()));
                }
            }
            // further devices of a known member
            None => {
                if !state.members.contains_key(&member) {
                    return Err(GroupError::UnknownMember(member.to_string()));
                }
            }
        }

        if state.check_device_free(&member, &device)? {
            state.register_device(MemberDevice::new(member, device));
        }
        Ok(())
    }

    fn handle_device_secret(
        &self,
        state: &mut IndexState,
        opened: &OpenedEntry,
        event: &DeviceSecretAdded,
    ) -> GroupResult<()> {
        let dest = PubKey::from_bytes(&event.dest_member_pk)?;
        let sender = PubKey::from_bytes(&event.device_pk)?;

        if opened.sender != sender {
            return Err(GroupError::SignatureInvalid(format!(
                "secret of device {} authored by {}",
                sender, opened.sender
            )));
        }

        let own = self.own.public();
        let chain = if dest == own.member {
            let bytes = zeroize::Zeroizing::new(event.secret.open(self.own.member())?);
            let chain = DeviceChainKey::from_bytes(&bytes)?;
            if chain.chain_id() != event.chain_id {
                return Err(GroupError::Internal(format!(
                    "sealed chain {} does not match announced chain {}",
                    chain.chain_id(),
                    event.chain_id
                )));
            }
            Some(chain)
        } else {
            None
        };

        if sender == own.device {
            state.sent_secrets.insert((dest, event.chain_id));
        }

        match chain {
            Some(chain) => {
                // the live sending chain is already known; earlier ones are not
                if sender != own.device || chain.chain_id() != self.keys.own_chain_id() {
                    self.keys.register_chain_key_for_device(sender, chain);
                }
                Ok(())
            }
            None => Err(GroupError::SecretMisdirected(dest.to_string())),
        }
    }

    fn handle_admin_role(
        &self,
        state: &mut IndexState,
        opened: &OpenedEntry,
        event: &AdminRoleGranted,
    ) -> GroupResult<()> {
        let grantee = PubKey::from_bytes(&event.member_pk)?;

        let granter = state
            .devices
            .get(&opened.sender)
            .map(|pair| pair.member)
            .ok_or_else(|| GroupError::UnknownDevice(opened.sender.to_string()))?;
        if !state.admins.contains(&granter) {
            return Err(GroupError::NotAdmin(granter.to_string()));
        }
        if !state.members.contains_key(&grantee) {
            return Err(GroupError::UnknownMember(grantee.to_string()));
        }

        state.admins.insert(grantee);
        Ok(())
    }

    /// Member keys, sorted.
    pub fn list_members(&self) -> Vec<PubKey> {
        let mut members: Vec<PubKey> = self.state.read().members.keys().copied().collect();
        members.sort();
        members
    }

    /// Device keys, sorted.
    pub fn list_devices(&self) -> Vec<PubKey> {
        let mut devices: Vec<PubKey> = self.state.read().devices.keys().copied().collect();
        devices.sort();
        devices
    }

    /// Admin member keys, sorted.
    pub fn list_admins(&self) -> Vec<PubKey> {
        let mut admins: Vec<PubKey> = self.state.read().admins.iter().copied().collect();
        admins.sort();
        admins
    }

    /// Every member/device pair, sorted.
    pub fn list_member_devices(&self) -> Vec<MemberDevice> {
        let mut pairs: Vec<MemberDevice> = self.state.read().devices.values().copied().collect();
        pairs.sort();
        pairs
    }

    pub fn member_count(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn device_count(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_admin(&self, member: &PubKey) -> bool {
        self.state.read().admins.contains(member)
    }

    pub fn get_member_by_device(&self, device: &PubKey) -> GroupResult<PubKey> {
        self.state
            .read()
            .devices
            .get(device)
            .map(|pair| pair.member)
            .ok_or_else(|| GroupError::UnknownDevice(device.to_string()))
    }

    /// Devices of `member`, in registration order.
    pub fn get_devices_for_member(&self, member: &PubKey) -> GroupResult<Vec<PubKey>> {
        self.state
            .read()
            .members
            .get(member)
            .map(|pairs| pairs.iter().map(|pair| pair.device).collect())
            .ok_or_else(|| GroupError::UnknownMember(member.to_string()))
    }

    /// Whether this device already sent its current chain to `member`.
    pub fn are_secrets_already_sent(&self, member: &PubKey) -> bool {
        let chain_id = self.keys.own_chain_id();
        self.state.read().sent_secrets.contains(&(*member, chain_id))
    }

    pub fn handled_count(&self) -> usize {
        self.state.read().handled_events.len()
    }

    /// Entries waiting for a member, device or admin role not seen yet.
    pub fn deferred_count(&self) -> usize {
        self.state.read().deferred.len()
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.read();
        IndexSnapshot {
            members: state
                .members
                .iter()
                .map(|(member, pairs)| (*member, pairs.iter().map(|p| p.device).collect()))
                .collect(),
            devices: state
                .devices
                .iter()
                .map(|(device, pair)| (*device, pair.member))
                .collect(),
            admins: state.admins.iter().copied().collect(),
            sent_secrets: state.sent_secrets.iter().copied().collect(),
            handled_events: state.handled_events.iter().copied().collect(),
        }
    }
}

impl StoreIndex for MetadataStoreIndex {
    fn update_index(&self, entries: &[LogEntry]) -> UpdateSummary {
        MetadataStoreIndex::update_index(self, entries)
    }

    fn get(&self) -> Box<dyn Any + Send> {
        Box::new(self.list_member_devices())
    }
}
