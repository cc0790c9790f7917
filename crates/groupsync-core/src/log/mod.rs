//! Replicated append-only log substrate
//!
//! The substrate is an external collaborator; this module fixes the interface
//! the stores consume from it and binds it to a group's keys.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  LogSubstrate (external): append / subscribe / list_entries     │
//! │  ├── MemoryLog: in-process substrate with at-least-once delivery│
//! │  └── (any P2P replicated log)                                   │
//! │                                                                 │
//! │  GroupLogBinding: one (group, log kind) pair                    │
//! │  ├── append: seal + sign with the device key, bounded by timeout│
//! │  └── open_entry: verify + decrypt before any index sees it      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each group has two logs: the metadata log (membership, secrets, admins)
//! and the message log.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::GroupResult;
use crate::group::GroupId;

mod binding;
mod memory;

pub use binding::{GroupLogBinding, OpenedEntry};
pub use memory::MemoryLog;

/// Content address of a log entry: BLAKE3 of its bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryHash(pub [u8; 32]);

impl EntryHash {
    /// Hash raw entry bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Which of a group's logs an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    Metadata,
    Messages,
}

impl LogKind {
    /// Label mixed into the per-log encryption key.
    pub fn label(self) -> &'static str {
        match self {
            LogKind::Metadata => "metadata",
            LogKind::Messages => "messages",
        }
    }
}

/// Address of one log on the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogAddress {
    pub group_id: GroupId,
    pub kind: LogKind,
}

impl LogAddress {
    pub fn new(group_id: GroupId, kind: LogKind) -> Self {
        Self { group_id, kind }
    }

    pub fn metadata(group_id: GroupId) -> Self {
        Self::new(group_id, LogKind::Metadata)
    }

    pub fn messages(group_id: GroupId) -> Self {
        Self::new(group_id, LogKind::Messages)
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.kind.label())
    }
}

/// One committed entry as delivered by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Content address of `payload`
    pub hash: EntryHash,
    /// Position in this replica's total order
    pub position: u64,
    /// Sealed envelope bytes
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(position: u64, payload: Vec<u8>) -> Self {
        Self {
            hash: EntryHash::of(&payload),
            position,
            payload,
        }
    }

    pub fn entry_ref(&self) -> EntryRef {
        EntryRef {
            hash: self.hash,
            position: self.position,
        }
    }
}

/// Handle returned once the substrate accepted an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef {
    pub hash: EntryHash,
    pub position: u64,
}

/// Append/subscribe/enumerate primitives of a replicated log.
///
/// Delivery is push-based and at-least-once: subscribers may see an entry more
/// than once. Entries from one device are delivered in the order that device
/// appended them; entries from different devices may interleave.
#[async_trait]
pub trait LogSubstrate: Send + Sync {
    /// Write one entry. Returns once the substrate durably accepted it, not
    /// necessarily once it replicated.
    async fn append(&self, address: &LogAddress, payload: Vec<u8>) -> GroupResult<EntryRef>;

    /// Stream of newly committed entries.
    fn subscribe(&self, address: &LogAddress) -> broadcast::Receiver<LogEntry>;

    /// Ordered snapshot of every entry committed so far.
    async fn list_entries(&self, address: &LogAddress) -> GroupResult<Vec<LogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivKey;

    #[test]
    fn test_entry_hash_is_content_address() {
        let a = LogEntry::new(0, b"same".to_vec());
        let b = LogEntry::new(5, b"same".to_vec());
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, LogEntry::new(0, b"other".to_vec()).hash);
    }

    #[test]
    fn test_log_address_display() {
        let group_id = GroupId::from(&PrivKey::generate().public());
        let address = LogAddress::metadata(group_id);
        assert!(address.to_string().ends_with("/metadata"));
        assert_ne!(address, LogAddress::messages(group_id));
    }
}
