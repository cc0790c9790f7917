//! Binding of one group log to the group's keys

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{EntryHash, EntryRef, LogAddress, LogEntry, LogKind, LogSubstrate};
use crate::crypto::{derive_key, KEY_SIZE};
use crate::envelope::GroupEnvelope;
use crate::error::{GroupError, GroupResult};
use crate::group::{Group, GroupId};
use crate::identity::{PrivKey, PubKey};
use crate::keystore::SignedEntryKeyStore;

/// A verified and decrypted log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEntry {
    pub hash: EntryHash,
    pub position: u64,
    /// Device that signed the entry
    pub sender: PubKey,
    /// The sender's append counter
    pub clock: u64,
    pub payload: Vec<u8>,
}

/// One (group, log kind) pair on the substrate.
///
/// Payloads are encrypted under a key derived from the group's shared key
/// and the log kind, then signed with the authoring device key through the
/// keystore. Reads verify before decrypting.
pub struct GroupLogBinding {
    group_id: GroupId,
    address: LogAddress,
    log_key: Zeroizing<[u8; KEY_SIZE]>,
    substrate: Arc<dyn LogSubstrate>,
    keystore: Arc<SignedEntryKeyStore>,
    clock: AtomicU64,
    append_timeout: Duration,
    closed: AtomicBool,
}

impl GroupLogBinding {
    pub fn new(
        group: &Group,
        kind: LogKind,
        substrate: Arc<dyn LogSubstrate>,
        keystore: Arc<SignedEntryKeyStore>,
        append_timeout: Duration,
    ) -> GroupResult<Self> {
        let info = format!("groupsync-log-key-{}", kind.label());
        let log_key = Zeroizing::new(derive_key(group.shared_key(), info.as_bytes())?);

        Ok(Self {
            group_id: group.id(),
            address: LogAddress::new(group.id(), kind),
            log_key,
            substrate,
            keystore,
            clock: AtomicU64::new(0),
            append_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn address(&self) -> &LogAddress {
        &self.address
    }

    /// Refuse further appends. Reads keep working.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Seal `payload` into signed envelope bytes without appending.
    pub fn seal_entry(&self, device: &PrivKey, payload: &[u8]) -> GroupResult<Vec<u8>> {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst);
        let envelope = GroupEnvelope::seal(
            payload,
            &self.group_id,
            device.public(),
            clock,
            &self.log_key,
            |data| self.keystore.sign(device, data),
        )?;
        envelope.to_bytes()
    }

    /// Seal and append `payload`, bounded by the append timeout.
    ///
    /// On timeout the caller gets [`GroupError::Timeout`], but the write may
    /// still reach the log later.
    pub async fn append(&self, device: &PrivKey, payload: &[u8]) -> GroupResult<EntryRef> {
        if self.is_closed() {
            return Err(GroupError::Closed);
        }
        let bytes = self.seal_entry(device, payload)?;

        match tokio::time::timeout(
            self.append_timeout,
            self.substrate.append(&self.address, bytes),
        )
        .await
        {
            Ok(Ok(entry_ref)) => {
                debug!(log = %self.address, entry = %entry_ref.hash, "Appended entry");
                Ok(entry_ref)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let ms = self.append_timeout.as_millis() as u64;
                warn!(log = %self.address, timeout_ms = ms, "Append timed out");
                Err(GroupError::Timeout(ms))
            }
        }
    }

    /// Verify and decrypt an entry delivered by the substrate.
    pub fn open_entry(&self, entry: &LogEntry) -> GroupResult<OpenedEntry> {
        let envelope = GroupEnvelope::from_bytes(&entry.payload)?;
        let payload = envelope.open(&self.group_id, &self.log_key, |sender, data, sig| {
            self.keystore.verify(sig, sender, data)
        })?;

        Ok(OpenedEntry {
            hash: entry.hash,
            position: entry.position,
            sender: envelope.sender,
            clock: envelope.clock,
            payload,
        })
    }

    /// Stream of newly committed entries.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.substrate.subscribe(&self.address)
    }

    /// Every entry committed so far, in log order.
    pub async fn list_entries(&self) -> GroupResult<Vec<LogEntry>> {
        self.substrate.list_entries(&self.address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;

    fn binding(group: &Group, kind: LogKind, log: Arc<MemoryLog>) -> GroupLogBinding {
        GroupLogBinding::new(
            group,
            kind,
            log,
            Arc::new(SignedEntryKeyStore::new()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_then_open() {
        let (group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        let binding = binding(&group, LogKind::Metadata, log);
        let device = PrivKey::generate();

        binding.append(&device, b"hello").await.unwrap();
        binding.append(&device, b"hello").await.unwrap();

        let entries = binding.list_entries().await.unwrap();
        // same payload, distinct entries
        assert_eq!(entries.len(), 2);

        let opened = binding.open_entry(&entries[1]).unwrap();
        assert_eq!(opened.payload, b"hello");
        assert_eq!(opened.sender, device.public());
        assert_eq!(opened.clock, 1);
    }

    #[tokio::test]
    async fn test_entries_do_not_cross_logs_or_groups() {
        let (group, _) = Group::generate();
        let (other_group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        let metadata = binding(&group, LogKind::Metadata, log.clone());
        let messages = binding(&group, LogKind::Messages, log.clone());
        let foreign = binding(&other_group, LogKind::Metadata, log);

        let device = PrivKey::generate();
        metadata.append(&device, b"payload").await.unwrap();
        let entry = metadata.list_entries().await.unwrap().remove(0);

        assert!(matches!(
            messages.open_entry(&entry),
            Err(GroupError::DecryptionFailed(_))
        ));
        assert!(matches!(
            foreign.open_entry(&entry),
            Err(GroupError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_entry_fails_to_open() {
        let (group, _) = Group::generate();
        let binding = binding(&group, LogKind::Metadata, Arc::new(MemoryLog::new()));
        let entry = LogEntry::new(0, vec![0xFF, 0x01]);
        assert!(matches!(
            binding.open_entry(&entry),
            Err(GroupError::Deserialization(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_timeout() {
        let (group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        log.set_append_delay(Some(Duration::from_secs(30)));
        let binding = binding(&group, LogKind::Metadata, log.clone());

        let result = binding.append(&PrivKey::generate(), b"slow").await;
        assert!(matches!(result, Err(GroupError::Timeout(5000))));
    }

    #[tokio::test]
    async fn test_closed_binding_rejects_appends() {
        let (group, _) = Group::generate();
        let binding = binding(&group, LogKind::Messages, Arc::new(MemoryLog::new()));
        let device = PrivKey::generate();
        binding.append(&device, b"before").await.unwrap();

        binding.close();
        assert!(matches!(
            binding.append(&device, b"after").await,
            Err(GroupError::Closed)
        ));
        assert_eq!(binding.list_entries().await.unwrap().len(), 1);
    }
}
