//! Per-device symmetric chain-key ratchet
//!
//! Every device owns a chain key that advances once per authored message:
//!
//! ```text
//! CK_0 ──▶ CK_1 ──▶ CK_2 ──▶ ...      CK_{n+1} = HKDF(CK_n, "groupsync-chain-key")
//!  │        │        │
//!  ▼        ▼        ▼
//! MK_0     MK_1     MK_2              MK_n     = HKDF(CK_n, "groupsync-message-key")
//! ```
//!
//! A device hands its current `(chain id, CK_n, n)` to other members through a
//! `DeviceSecretAdded` metadata event. Holders derive forward from the first
//! state they know; positions before it stay undecryptable.
//!
//! A device that starts over with a new random chain (a new chain id) opens a
//! new epoch. Holders keep every epoch of a device side by side, and message
//! entries name the epoch they were sealed in.
//!
//! Holders keep a chain state every [`CHECKPOINT_INTERVAL`] positions, so any
//! position at or after the first known one can be derived again and message
//! listings stay repeatable. Only skipping ahead of the furthest derived
//! position is bounded.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{derive_key, SecretBox, KEY_SIZE};
use crate::error::{GroupError, GroupResult};
use crate::identity::PubKey;

const CHAIN_KEY_INFO: &[u8] = b"groupsync-chain-key";
const MESSAGE_KEY_INFO: &[u8] = b"groupsync-message-key";

/// Distance between two kept chain states of a device.
pub const CHECKPOINT_INTERVAL: u64 = 64;

/// Random identifier of one chain epoch of a device.
pub type ChainId = u64;

/// One position of a device chain: the chain key and its counter.
///
/// This is also the secret shipped to other members.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DeviceChainKey {
    chain_id: ChainId,
    chain_key: [u8; KEY_SIZE],
    counter: u64,
}

impl DeviceChainKey {
    /// Fresh random chain starting at position 0.
    pub fn generate() -> Self {
        Self::new(rand::random(), SecretBox::generate_key(), 0)
    }

    pub fn new(chain_id: ChainId, chain_key: [u8; KEY_SIZE], counter: u64) -> Self {
        Self {
            chain_id,
            chain_key,
            counter,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Position of the next message key.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Message key for the current position.
    pub fn message_key(&self) -> GroupResult<Zeroizing<[u8; KEY_SIZE]>> {
        Ok(Zeroizing::new(derive_key(&self.chain_key, MESSAGE_KEY_INFO)?))
    }

    /// Step to the next position, erasing the current chain key.
    pub fn advance(&mut self) -> GroupResult<()> {
        let mut next = derive_key(&self.chain_key, CHAIN_KEY_INFO)?;
        self.chain_key.copy_from_slice(&next);
        next.zeroize();
        self.counter += 1;
        Ok(())
    }

    pub fn to_bytes(&self) -> GroupResult<Zeroizing<Vec<u8>>> {
        postcard::to_allocvec(self)
            .map(Zeroizing::new)
            .map_err(|e| GroupError::Serialization(format!("failed to encode chain key: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> GroupResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| GroupError::Deserialization(format!("failed to decode chain key: {}", e)))
    }
}

impl std::fmt::Debug for DeviceChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChainKey")
            .field("chain_id", &self.chain_id)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Known state of one epoch of one device.
struct DeviceRatchet {
    /// First known state, then one every `CHECKPOINT_INTERVAL` positions
    checkpoints: BTreeMap<u64, DeviceChainKey>,
    /// Furthest derived state
    head: DeviceChainKey,
}

impl DeviceRatchet {
    fn new(chain: DeviceChainKey) -> Self {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(chain.counter(), chain.clone());
        Self {
            checkpoints,
            head: chain,
        }
    }

    fn first_counter(&self) -> u64 {
        self.checkpoints
            .first_key_value()
            .map(|(counter, _)| *counter)
            .unwrap_or_else(|| self.head.counter())
    }

    fn key_at(
        &mut self,
        counter: u64,
        max_skipped_keys: usize,
    ) -> GroupResult<Option<Zeroizing<[u8; KEY_SIZE]>>> {
        let first = self.first_counter();
        if counter < first {
            return Ok(None);
        }

        if counter >= self.head.counter() {
            let distance = counter - self.head.counter();
            if distance > max_skipped_keys as u64 {
                return Err(GroupError::Crypto(format!(
                    "message counter {} is {} positions ahead of the known chain",
                    counter, distance
                )));
            }
            while self.head.counter() < counter {
                self.head.advance()?;
                if (self.head.counter() - first) % CHECKPOINT_INTERVAL == 0 {
                    self.checkpoints.insert(self.head.counter(), self.head.clone());
                }
            }
            return self.head.message_key().map(Some);
        }

        let Some((_, checkpoint)) = self.checkpoints.range(..=counter).next_back() else {
            return Ok(None);
        };
        let mut chain = checkpoint.clone();
        while chain.counter() < counter {
            chain.advance()?;
        }
        chain.message_key().map(Some)
    }
}

/// Message key holder for one group.
///
/// Keeps the local device's sending chain and the receiving state of every
/// device epoch whose secret is known, including the local device's own.
pub struct MessageKeys {
    own_device: PubKey,
    max_skipped_keys: usize,
    inner: Mutex<KeysInner>,
}

struct KeysInner {
    own: DeviceChainKey,
    devices: HashMap<(PubKey, ChainId), DeviceRatchet>,
}

impl MessageKeys {
    /// Start a holder with a fresh sending chain for `own_device`.
    pub fn new(own_device: PubKey, max_skipped_keys: usize) -> Self {
        Self::with_own_chain(own_device, DeviceChainKey::generate(), max_skipped_keys)
    }

    /// Start a holder that keeps sending on a previously used chain.
    pub fn with_own_chain(own_device: PubKey, own: DeviceChainKey, max_skipped_keys: usize) -> Self {
        let mut devices = HashMap::new();
        devices.insert((own_device, own.chain_id()), DeviceRatchet::new(own.clone()));

        Self {
            own_device,
            max_skipped_keys,
            inner: Mutex::new(KeysInner { own, devices }),
        }
    }

    pub fn own_device(&self) -> &PubKey {
        &self.own_device
    }

    /// Current state of the local sending chain.
    pub fn own_device_chain_key(&self) -> DeviceChainKey {
        self.inner.lock().own.clone()
    }

    /// First known state of the local sending chain.
    ///
    /// Persist this and pass it back to [`MessageKeys::with_own_chain`] to keep
    /// the chain, and every message sent on it, across restarts.
    pub fn own_chain_origin(&self) -> DeviceChainKey {
        let inner = self.inner.lock();
        inner
            .devices
            .get(&(self.own_device, inner.own.chain_id()))
            .and_then(|ratchet| ratchet.checkpoints.first_key_value())
            .map(|(_, chain)| chain.clone())
            .unwrap_or_else(|| inner.own.clone())
    }

    pub fn own_chain_id(&self) -> ChainId {
        self.inner.lock().own.chain_id()
    }

    /// Move the local sending chain to at least `counter`.
    ///
    /// Used after a restart so positions already present in the log are not
    /// reused.
    pub fn skip_own_to(&self, counter: u64) -> GroupResult<()> {
        let mut inner = self.inner.lock();
        let skipped = counter.saturating_sub(inner.own.counter());
        while inner.own.counter() < counter {
            inner.own.advance()?;
        }
        if skipped > 0 {
            debug!(counter, skipped, "Skipped own chain positions already in the log");
        }
        Ok(())
    }

    /// Register a chain state received for `device`.
    ///
    /// Within one epoch, a state earlier than the known one replaces it (it
    /// can derive everything the old one could); a later or equal one is
    /// ignored. A state of an unseen epoch is always adopted. Returns whether
    /// the state was adopted.
    pub fn register_chain_key_for_device(&self, device: PubKey, chain: DeviceChainKey) -> bool {
        let mut inner = self.inner.lock();
        let slot = (device, chain.chain_id());
        let adopt = match inner.devices.get(&slot) {
            Some(existing) => chain.counter() < existing.first_counter(),
            None => true,
        };

        if adopt {
            debug!(device = %device, chain = chain.chain_id(), counter = chain.counter(), "Registered device chain key");
            inner.devices.insert(slot, DeviceRatchet::new(chain));
        } else {
            trace!(device = %device, chain = chain.chain_id(), counter = chain.counter(), "Chain key already known");
        }
        adopt
    }

    /// Whether a chain state of any epoch is known for `device`.
    pub fn has_device(&self, device: &PubKey) -> bool {
        self.inner.lock().devices.keys().any(|(known, _)| known == device)
    }

    /// Whether a state of epoch `chain_id` is known for `device`.
    pub fn has_chain(&self, device: &PubKey, chain_id: ChainId) -> bool {
        self.inner.lock().devices.contains_key(&(*device, chain_id))
    }

    /// Take the next message key of the local sending chain.
    pub fn next_own_message_key(&self) -> GroupResult<(ChainId, u64, Zeroizing<[u8; KEY_SIZE]>)> {
        let mut inner = self.inner.lock();
        let counter = inner.own.counter();
        let key = inner.own.message_key()?;
        inner.own.advance()?;
        Ok((inner.own.chain_id(), counter, key))
    }

    /// Message key of `device` in epoch `chain_id` at `counter`.
    ///
    /// `Ok(None)` means the key is not available: the epoch's secret is
    /// unknown or the position precedes the first known state. Fails when the
    /// position is more than `max_skipped_keys` ahead of the furthest derived
    /// one.
    pub fn message_key(
        &self,
        device: &PubKey,
        chain_id: ChainId,
        counter: u64,
    ) -> GroupResult<Option<Zeroizing<[u8; KEY_SIZE]>>> {
        let mut inner = self.inner.lock();
        match inner.devices.get_mut(&(*device, chain_id)) {
            Some(ratchet) => ratchet.key_at(counter, self.max_skipped_keys),
            None => Ok(None),
        }
    }
}
