//! In-process log substrate
//!
//! Every handle to the same `MemoryLog` sees one shared replica, which makes
//! it usable both for embedding and for multi-peer tests. Appending the same
//! bytes twice is a no-op (entries are content-addressed); `redeliver` pushes
//! an already committed entry to subscribers again to exercise at-least-once
//! delivery.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{EntryHash, EntryRef, LogAddress, LogEntry, LogSubstrate};
use crate::error::{GroupError, GroupResult};

/// Capacity of each log's delivery channel
const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

struct LogState {
    entries: Vec<LogEntry>,
    seen: HashSet<EntryHash>,
    tx: broadcast::Sender<LogEntry>,
}

impl LogState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            tx,
        }
    }
}

/// Shared in-memory replica of every group log.
#[derive(Default)]
pub struct MemoryLog {
    logs: Mutex<HashMap<LogAddress, LogState>>,
    append_delay: Mutex<Option<Duration>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every append, simulating a slow write acknowledgement.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        *self.append_delay.lock() = delay;
    }

    /// Deliver a committed entry to subscribers again.
    pub fn redeliver(&self, address: &LogAddress, hash: &EntryHash) -> GroupResult<()> {
        let logs = self.logs.lock();
        let state = logs
            .get(address)
            .ok_or_else(|| GroupError::Log(format!("no log at {}", address)))?;
        let entry = state
            .entries
            .iter()
            .find(|e| &e.hash == hash)
            .ok_or_else(|| GroupError::Log(format!("entry {} not found in {}", hash, address)))?;

        let _ = state.tx.send(entry.clone());
        debug!(%address, entry = %hash, "Redelivered log entry");
        Ok(())
    }

    /// Number of entries committed to `address`.
    pub fn len(&self, address: &LogAddress) -> usize {
        self.logs
            .lock()
            .get(address)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn commit(&self, address: &LogAddress, payload: Vec<u8>) -> EntryRef {
        let mut logs = self.logs.lock();
        let state = logs.entry(*address).or_insert_with(LogState::new);

        let hash = EntryHash::of(&payload);
        if state.seen.contains(&hash) {
            if let Some(existing) = state.entries.iter().find(|e| e.hash == hash) {
                trace!(%address, entry = %hash, "Duplicate append ignored");
                return existing.entry_ref();
            }
        }

        let entry = LogEntry::new(state.entries.len() as u64, payload);
        let entry_ref = entry.entry_ref();
        state.seen.insert(hash);
        state.entries.push(entry.clone());

        // No subscribers is fine; entries stay listable.
        let _ = state.tx.send(entry);
        entry_ref
    }
}

#[async_trait]
impl LogSubstrate for MemoryLog {
    async fn append(&self, address: &LogAddress, payload: Vec<u8>) -> GroupResult<EntryRef> {
        let delay = *self.append_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.commit(address, payload))
    }

    fn subscribe(&self, address: &LogAddress) -> broadcast::Receiver<LogEntry> {
        self.logs
            .lock()
            .entry(*address)
            .or_insert_with(LogState::new)
            .tx
            .subscribe()
    }

    async fn list_entries(&self, address: &LogAddress) -> GroupResult<Vec<LogEntry>> {
        Ok(self
            .logs
            .lock()
            .get(address)
            .map(|s| s.entries.clone())
            .unwrap_or_default())
    }
}
