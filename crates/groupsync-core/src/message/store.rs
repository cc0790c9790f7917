//! Message store: append and list the group's message log

use std::sync::Arc;
use std::vec;

use tracing::{debug, warn};

use super::{GroupMessageEvent, MessageItem, MessageKeys, MessagePayload};
use crate::crypto::SecretBox;
use crate::error::{GroupError, GroupResult};
use crate::group::OwnMemberDevice;
use crate::log::{EntryRef, GroupLogBinding, LogEntry};

/// Append side and listing of one group's message log.
#[derive(Clone)]
pub struct MessageStore {
    binding: Arc<GroupLogBinding>,
    own: Arc<OwnMemberDevice>,
    keys: Arc<MessageKeys>,
}

impl MessageStore {
    pub fn new(binding: Arc<GroupLogBinding>, own: Arc<OwnMemberDevice>, keys: Arc<MessageKeys>) -> Self {
        Self { binding, own, keys }
    }

    /// Encrypt `payload` under the next own message key and append it.
    pub async fn add_message(&self, payload: &[u8]) -> GroupResult<EntryRef> {
        let (chain_id, counter, key) = self.keys.next_own_message_key()?;
        let ciphertext = SecretBox::new(&key).encrypt(payload)?;

        let body = postcard::to_allocvec(&MessagePayload {
            chain_id,
            counter,
            ciphertext,
        })
            .map_err(|e| GroupError::Serialization(format!("failed to encode message: {}", e)))?;

        let entry_ref = self.binding.append(self.own.device(), &body).await?;
        debug!(group = %self.binding.group_id(), counter, entry = %entry_ref.hash, "Added message");
        Ok(entry_ref)
    }

    /// Lazily decrypt every message committed so far.
    ///
    /// The sequence is a snapshot of the log at call time; call again to see
    /// newer entries or messages whose key arrived since.
    pub async fn list_messages(&self) -> GroupResult<MessageIter> {
        let entries = self.binding.list_entries().await?;
        Ok(MessageIter {
            entries: entries.into_iter(),
            binding: self.binding.clone(),
            keys: self.keys.clone(),
        })
    }

    /// Move the sending chain past every position this device already used
    /// in the log on its current chain.
    pub(crate) async fn resume_own_chain(&self) -> GroupResult<()> {
        let own_device = self.own.device().public();
        let chain_id = self.keys.own_chain_id();

        let mut next = None;
        for entry in self.binding.list_entries().await? {
            let Ok(opened) = self.binding.open_entry(&entry) else {
                continue;
            };
            if opened.sender != own_device {
                continue;
            }
            if let Ok(body) = postcard::from_bytes::<MessagePayload>(&opened.payload) {
                if body.chain_id == chain_id {
                    next = next.max(Some(body.counter + 1));
                }
            }
        }

        if let Some(counter) = next {
            self.keys.skip_own_to(counter)?;
        }
        Ok(())
    }

    /// Open and decrypt one message entry.
    pub fn decrypt_entry(&self, entry: &LogEntry) -> GroupResult<MessageItem> {
        decrypt_entry(&self.binding, &self.keys, entry)
    }
}

fn decrypt_entry(
    binding: &GroupLogBinding,
    keys: &MessageKeys,
    entry: &LogEntry,
) -> GroupResult<MessageItem> {
    let opened = binding.open_entry(entry)?;
    let undecryptable = |reason: String| MessageItem::Undecryptable {
        entry: entry.hash,
        device: opened.sender,
        reason,
    };

    let body: MessagePayload = match postcard::from_bytes(&opened.payload) {
        Ok(body) => body,
        Err(e) => return Ok(undecryptable(format!("failed to decode message: {}", e))),
    };

    let key = match keys.message_key(&opened.sender, body.chain_id, body.counter) {
        Ok(Some(key)) => key,
        Ok(None) => {
            return Ok(MessageItem::Pending {
                entry: entry.hash,
                device: opened.sender,
                counter: body.counter,
            })
        }
        Err(e) => return Ok(undecryptable(e.to_string())),
    };

    match SecretBox::new(&key).decrypt(&body.ciphertext) {
        Ok(payload) => Ok(MessageItem::Decrypted(GroupMessageEvent {
            entry: entry.hash,
            device: opened.sender,
            counter: body.counter,
            payload,
        })),
        Err(e) => Ok(undecryptable(e.to_string())),
    }
}

/// Lazy, finite sequence over a snapshot of the message log.
///
/// Every authentic entry yields one item, whether or not its key is known, so
/// the length of a listing only depends on the log. Entries that fail the
/// envelope check (forged, foreign, or garbage) are not group messages; they
/// are logged and skipped.
pub struct MessageIter {
    entries: vec::IntoIter<LogEntry>,
    binding: Arc<GroupLogBinding>,
    keys: Arc<MessageKeys>,
}

impl Iterator for MessageIter {
    type Item = MessageItem;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            match decrypt_entry(&self.binding, &self.keys, &entry) {
                Ok(item) => return Some(item),
                Err(e) => {
                    warn!(entry = %entry.hash, error = %e, "Skipping unauthenticated message entry");
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::group::Group;
    use crate::keystore::SignedEntryKeyStore;
    use crate::log::{LogKind, MemoryLog};

    fn store(group: &Group, log: Arc<MemoryLog>) -> MessageStore {
        store_with_bound(group, log, 64)
    }

    fn store_with_bound(group: &Group, log: Arc<MemoryLog>, max_skipped_keys: usize) -> MessageStore {
        let own = Arc::new(OwnMemberDevice::generate());
        let binding = GroupLogBinding::new(
            group,
            LogKind::Messages,
            log,
            Arc::new(SignedEntryKeyStore::new()),
            Duration::from_secs(5),
        )
        .unwrap();
        let keys = Arc::new(MessageKeys::new(own.device().public(), max_skipped_keys));
        MessageStore::new(Arc::new(binding), own, keys)
    }

    #[tokio::test]
    async fn test_own_messages_listed_in_order() {
        let (group, _) = Group::generate();
        let store = store(&group, Arc::new(MemoryLog::new()));

        store.add_message(b"one").await.unwrap();
        store.add_message(b"two").await.unwrap();

        let payloads: Vec<Vec<u8>> = store
            .list_messages()
            .await
            .unwrap()
            .filter_map(MessageItem::into_decrypted)
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_listing_is_repeatable() {
        let (group, _) = Group::generate();
        let store = store(&group, Arc::new(MemoryLog::new()));
        store.add_message(b"again").await.unwrap();

        for _ in 0..3 {
            let items: Vec<MessageItem> = store.list_messages().await.unwrap().collect();
            assert_eq!(items.len(), 1);
            assert!(items[0].is_decrypted());
        }
    }

    #[tokio::test]
    async fn test_pending_until_secret_registered() {
        let (group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        let alice = store(&group, log.clone());
        let bob = store(&group, log);

        let secret = alice.keys.own_device_chain_key();
        alice.add_message(b"hello bob").await.unwrap();

        let items: Vec<MessageItem> = bob.list_messages().await.unwrap().collect();
        assert!(matches!(items[0], MessageItem::Pending { counter: 0, .. }));

        bob.keys
            .register_chain_key_for_device(alice.own.device().public(), secret);
        let items: Vec<MessageItem> = bob.list_messages().await.unwrap().collect();
        match &items[0] {
            MessageItem::Decrypted(msg) => {
                assert_eq!(msg.payload, b"hello bob");
                assert_eq!(msg.device, alice.own.device().public());
            }
            other => panic!("expected decrypted message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_entries_are_skipped() {
        let (group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        let store = store(&group, log.clone());

        crate::log::LogSubstrate::append(&*log, store.binding.address(), vec![1, 2, 3])
            .await
            .unwrap();
        store.add_message(b"valid").await.unwrap();

        let items: Vec<MessageItem> = store.list_messages().await.unwrap().collect();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_listing_longer_than_skip_bound_is_repeatable() {
        let (group, _) = Group::generate();
        let store = store_with_bound(&group, Arc::new(MemoryLog::new()), 8);

        for i in 0..20u8 {
            store.add_message(&[i]).await.unwrap();
        }

        for _ in 0..2 {
            let payloads: Vec<Vec<u8>> = store
                .list_messages()
                .await
                .unwrap()
                .filter_map(MessageItem::into_decrypted)
                .map(|m| m.payload)
                .collect();
            assert_eq!(payloads, (0..20u8).map(|i| vec![i]).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_undecryptable_entries_are_listed() {
        let (group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        let alice = store(&group, log.clone());
        let bob = store(&group, log);
        bob.keys
            .register_chain_key_for_device(alice.own.device().public(), alice.keys.own_device_chain_key());

        let chain_id = alice.keys.own_chain_id();
        for (counter, ciphertext) in [(1_000, vec![0u8; 40]), (0, vec![7u8; 40])] {
            let body = postcard::to_allocvec(&MessagePayload {
                chain_id,
                counter,
                ciphertext,
            })
            .unwrap();
            alice.binding.append(alice.own.device(), &body).await.unwrap();
        }

        let items: Vec<MessageItem> = bob.list_messages().await.unwrap().collect();
        assert_eq!(items.len(), 2);
        for item in &items {
            assert!(matches!(item, MessageItem::Undecryptable { .. }));
            assert_eq!(item.device(), &alice.own.device().public());
        }
    }

    #[tokio::test]
    async fn test_resumed_chain_continues_after_last_own_message() {
        let (group, _) = Group::generate();
        let log = Arc::new(MemoryLog::new());
        let first = store(&group, log.clone());
        for _ in 0..3 {
            first.add_message(b"before").await.unwrap();
        }

        let keys = Arc::new(MessageKeys::with_own_chain(
            first.own.device().public(),
            first.keys.own_chain_origin(),
            64,
        ));
        let resumed = MessageStore::new(first.binding.clone(), first.own.clone(), keys);
        resumed.resume_own_chain().await.unwrap();
        resumed.add_message(b"after").await.unwrap();

        let items: Vec<MessageItem> = resumed.list_messages().await.unwrap().collect();
        let counters: Vec<u64> = items
            .into_iter()
            .filter_map(MessageItem::into_decrypted)
            .map(|m| m.counter)
            .collect();
        assert_eq!(counters, vec![0, 1, 2, 3]);
    }
}
