//! Message log: per-device ratchet and message store

use serde::{Deserialize, Serialize};

use crate::identity::PubKey;
use crate::log::EntryHash;

mod ratchet;
mod store;

pub use ratchet::{ChainId, DeviceChainKey, MessageKeys, CHECKPOINT_INTERVAL};
pub use store::{MessageIter, MessageStore};

/// A decrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessageEvent {
    pub entry: EntryHash,
    /// Authoring device
    pub device: PubKey,
    /// Position in the device's chain
    pub counter: u64,
    pub payload: Vec<u8>,
}

/// One message log entry as seen by this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageItem {
    Decrypted(GroupMessageEvent),
    /// The key for this position is not known (yet)
    Pending {
        entry: EntryHash,
        device: PubKey,
        counter: u64,
    },
    /// The entry is authentic but its body could not be decrypted
    Undecryptable {
        entry: EntryHash,
        device: PubKey,
        reason: String,
    },
}

impl MessageItem {
    pub fn is_decrypted(&self) -> bool {
        matches!(self, MessageItem::Decrypted(_))
    }

    pub fn into_decrypted(self) -> Option<GroupMessageEvent> {
        match self {
            MessageItem::Decrypted(event) => Some(event),
            MessageItem::Pending { .. } | MessageItem::Undecryptable { .. } => None,
        }
    }

    pub fn device(&self) -> &PubKey {
        match self {
            MessageItem::Decrypted(event) => &event.device,
            MessageItem::Pending { device, .. } => device,
            MessageItem::Undecryptable { device, .. } => device,
        }
    }
}

/// Body of a message log entry, inside the group envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MessagePayload {
    /// Epoch of the authoring device's chain
    pub chain_id: ChainId,
    pub counter: u64,
    /// Nonce + ciphertext under the message key at `counter`
    pub ciphertext: Vec<u8>,
}
