//! Group context: everything one device needs for one joined group
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  GroupContext                                                   │
//! │  ├── keystore / sig chain: member + device keys                 │
//! │  ├── metadata log ──▶ MetadataStoreIndex ──▶ MessageKeys        │
//! │  │   └── metadata consumer task (batches, replays on lag)       │
//! │  ├── message log ──▶ MessageStore                               │
//! │  │   └── message consumer task (decrypts new entries)           │
//! │  └── EventEmitter ──▶ subscribers                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Opening a context subscribes to both logs, then replays the full metadata
//! log into a fresh index, then starts the consumer tasks. Closing cancels the
//! tasks and waits for them; a batch being applied always completes first.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GroupConfig;
use crate::error::GroupResult;
use crate::events::{EventEmitter, EventSubscription, GroupEvent};
use crate::group::{Group, GroupId, OwnMemberDevice};
use crate::identity::{PrivKey, PubKey};
use crate::keystore::SignedEntryKeyStore;
use crate::log::{GroupLogBinding, LogEntry, LogKind, LogSubstrate};
use crate::member_store::MemberStore;
use crate::message::{DeviceChainKey, MessageItem, MessageKeys, MessageStore};
use crate::metadata::{MetadataStore, MetadataStoreIndex};
use crate::sigchain::SigChain;

/// Per-group aggregate exposed to the messaging layer.
pub struct GroupContext {
    group: Arc<Group>,
    own: Arc<OwnMemberDevice>,
    keystore: Arc<SignedEntryKeyStore>,
    sig_chain: SigChain,
    message_keys: Arc<MessageKeys>,
    metadata_store: MetadataStore,
    member_store: MemberStore,
    message_store: MessageStore,
    emitter: EventEmitter,
    bindings: [Arc<GroupLogBinding>; 2],
    config: GroupConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupContext {
    /// Open `group` for the local member/device on `substrate`.
    ///
    /// The device starts a new sending chain; peers need a fresh
    /// [`MetadataStore::send_secret`] to read what it sends from now on.
    /// Must be called from within a tokio runtime.
    pub async fn open(
        group: Group,
        own: OwnMemberDevice,
        substrate: Arc<dyn LogSubstrate>,
        config: GroupConfig,
    ) -> GroupResult<Self> {
        Self::open_with_chain(group, own, None, substrate, config).await
    }

    /// Open `group`, continuing the sending chain `own_chain` when given.
    ///
    /// `own_chain` is a state previously taken from
    /// [`MessageKeys::own_chain_origin`]. Positions already used in the
    /// message log are skipped, and secrets already sent for that chain stay
    /// valid.
    pub async fn open_with_chain(
        group: Group,
        own: OwnMemberDevice,
        own_chain: Option<DeviceChainKey>,
        substrate: Arc<dyn LogSubstrate>,
        config: GroupConfig,
    ) -> GroupResult<Self> {
        config.validate()?;

        let group = Arc::new(group);
        let own = Arc::new(own);
        let group_id = group.id();

        let keystore = Arc::new(SignedEntryKeyStore::new());
        keystore.set_key(own.member().clone());
        keystore.set_key(own.device().clone());

        let mut sig_chain = SigChain::new();
        sig_chain.init(own.member())?;
        sig_chain.add_entry(own.member(), &own.device().public())?;

        let metadata_binding = Arc::new(GroupLogBinding::new(
            &group,
            LogKind::Metadata,
            substrate.clone(),
            keystore.clone(),
            config.append_timeout(),
        )?);
        let message_binding = Arc::new(GroupLogBinding::new(
            &group,
            LogKind::Messages,
            substrate,
            keystore.clone(),
            config.append_timeout(),
        )?);

        let resumed = own_chain.is_some();
        let message_keys = Arc::new(match own_chain {
            Some(chain) => MessageKeys::with_own_chain(own.device().public(), chain, config.max_skipped_keys),
            None => MessageKeys::new(own.device().public(), config.max_skipped_keys),
        });
        let emitter = EventEmitter::new(config.event_channel_capacity);

        let index = Arc::new(MetadataStoreIndex::new(
            group.clone(),
            metadata_binding.clone(),
            own.clone(),
            message_keys.clone(),
            emitter.clone(),
        ));
        let metadata_store = MetadataStore::new(
            group.clone(),
            metadata_binding.clone(),
            own.clone(),
            message_keys.clone(),
            index.clone(),
        );
        let member_store = MemberStore::new(
            group.clone(),
            metadata_binding.clone(),
            keystore.clone(),
            index.clone(),
        );
        let message_store = MessageStore::new(message_binding.clone(), own.clone(), message_keys.clone());

        // Subscribe before the rebuild so nothing committed in between is missed
        let metadata_rx = metadata_binding.subscribe();
        let message_rx = message_binding.subscribe();

        let entries = metadata_binding.list_entries().await?;
        for batch in entries.chunks(config.replication_batch_size) {
            index.update_index(batch);
        }
        if resumed {
            message_store.resume_own_chain().await?;
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(metadata_consumer(
                group_id,
                metadata_binding.clone(),
                index.clone(),
                metadata_rx,
                config.replication_batch_size,
                cancel.clone(),
            )),
            tokio::spawn(message_consumer(
                group_id,
                message_store.clone(),
                emitter.clone(),
                message_rx,
                cancel.clone(),
            )),
        ];

        info!(
            group = %group_id,
            member = %own.member().public(),
            device = %own.device().public(),
            members = index.member_count(),
            devices = index.device_count(),
            chain = message_keys.own_chain_id(),
            "Opened group context"
        );

        Ok(Self {
            group,
            own,
            keystore,
            sig_chain,
            message_keys,
            metadata_store,
            member_store,
            message_store,
            emitter,
            bindings: [metadata_binding, message_binding],
            config,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_id(&self) -> GroupId {
        self.group.id()
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn message_store(&self) -> &MessageStore {
        &self.message_store
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.metadata_store
    }

    pub fn member_store(&self) -> &MemberStore {
        &self.member_store
    }

    /// Shortcut to the metadata index.
    pub fn index(&self) -> &MetadataStoreIndex {
        self.metadata_store.index()
    }

    pub fn message_keys(&self) -> &Arc<MessageKeys> {
        &self.message_keys
    }

    pub fn keystore(&self) -> &Arc<SignedEntryKeyStore> {
        &self.keystore
    }

    /// The local member's key chain (member key, then device key).
    pub fn sig_chain(&self) -> &SigChain {
        &self.sig_chain
    }

    pub fn member_pubkey(&self) -> PubKey {
        self.own.member().public()
    }

    pub fn device_pubkey(&self) -> PubKey {
        self.own.device().public()
    }

    pub fn member_priv_key(&self) -> &PrivKey {
        self.own.member()
    }

    pub fn device_priv_key(&self) -> &PrivKey {
        self.own.device()
    }

    /// Subscribe to metadata and message notifications.
    pub fn subscribe(&self) -> EventSubscription {
        self.emitter.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the consumer tasks and wait for them to finish.
    ///
    /// Store handles cloned out of the context fail with
    /// [`GroupError::Closed`](crate::error::GroupError::Closed) on append afterwards.
    pub async fn close(self) {
        for binding in &self.bindings {
            binding.close();
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(group = %self.group.id(), error = %e, "Consumer task failed");
            }
        }
        info!(group = %self.group.id(), "Closed group context");
    }
}

impl Drop for GroupContext {
    fn drop(&mut self) {
        for binding in &self.bindings {
            binding.close();
        }
        self.cancel.cancel();
    }
}

/// Pull newly committed metadata entries into the index.
///
/// Entries already waiting are applied together, up to `batch_size`. When the
/// subscription lags, the whole log is replayed; replay is idempotent.
async fn metadata_consumer(
    group_id: GroupId,
    binding: Arc<GroupLogBinding>,
    index: Arc<MetadataStoreIndex>,
    mut rx: broadcast::Receiver<LogEntry>,
    batch_size: usize,
    cancel: CancellationToken,
) {
    debug!(group = %group_id, "Metadata consumer started");

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };

        let mut lagged = false;
        let mut batch = Vec::new();
        match first {
            Ok(entry) => batch.push(entry),
            Err(RecvError::Lagged(n)) => {
                warn!(group = %group_id, missed = n, "Metadata consumer lagged, replaying log");
                lagged = true;
            }
            Err(RecvError::Closed) => break,
        }

        while !lagged && batch.len() < batch_size {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(TryRecvError::Lagged(n)) => {
                    warn!(group = %group_id, missed = n, "Metadata consumer lagged, replaying log");
                    lagged = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if !batch.is_empty() {
            let summary = index.update_index(&batch);
            debug!(group = %group_id, ?summary, "Applied metadata batch");
        }

        if lagged {
            match binding.list_entries().await {
                Ok(entries) => {
                    for chunk in entries.chunks(batch_size) {
                        index.update_index(chunk);
                    }
                }
                Err(e) => warn!(group = %group_id, error = %e, "Metadata replay failed"),
            }
        }
    }

    debug!(group = %group_id, "Metadata consumer stopped");
}

/// Decrypt newly committed messages and notify subscribers.
async fn message_consumer(
    group_id: GroupId,
    store: MessageStore,
    emitter: EventEmitter,
    mut rx: broadcast::Receiver<LogEntry>,
    cancel: CancellationToken,
) {
    debug!(group = %group_id, "Message consumer started");

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };

        match received {
            Ok(entry) => match store.decrypt_entry(&entry) {
                Ok(MessageItem::Decrypted(message)) => {
                    emitter.emit(GroupEvent::Message(message));
                }
                Ok(MessageItem::Pending { device, counter, .. }) => {
                    debug!(group = %group_id, entry = %entry.hash, %device, counter, "Message key not known yet");
                }
                Ok(MessageItem::Undecryptable { device, reason, .. }) => {
                    warn!(group = %group_id, entry = %entry.hash, %device, %reason, "Undecryptable message entry");
                }
                Err(e) => {
                    warn!(group = %group_id, entry = %entry.hash, error = %e, "Unreadable message entry");
                }
            },
            Err(RecvError::Lagged(n)) => {
                warn!(group = %group_id, missed = n, "Message consumer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    debug!(group = %group_id, "Message consumer stopped");
}
