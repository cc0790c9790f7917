//! Identity key-lifecycle chain
//!
//! A SigChain records which keys may sign on behalf of an identity over time.
//! Each entry is signed by a key that is valid at that point of the chain and
//! linked by hash to its predecessor:
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  InitChain   │───▶│   AddKey     │───▶│  RemoveKey   │
//! │  subject: K0 │    │  subject: K1 │    │  subject: K0 │
//! │  signer: K0  │    │  signer: K0  │    │  signer: K1  │
//! │  parent: -   │    │  parent: H0  │    │  parent: H1  │
//! └──────────────┘    └──────────────┘    └──────────────┘
//! valid keys: {K0}     {K0, K1}            {K1}
//! ```
//!
//! Entries are only stored once fully signed; a failed append leaves the
//! chain untouched.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GroupError, GroupResult};
use crate::identity::{PrivKey, PubKey};

/// Kind of a chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigChainEntryType {
    /// First entry, self-signed by the identity's first key
    InitChain,
    /// Authorizes a new key
    AddKey,
    /// Revokes a key
    RemoveKey,
}

impl SigChainEntryType {
    fn code(self) -> u8 {
        match self {
            SigChainEntryType::InitChain => 1,
            SigChainEntryType::AddKey => 2,
            SigChainEntryType::RemoveKey => 3,
        }
    }
}

/// Expiry sentinel for non-expiring entries: 2199-12-31T00:00:00Z.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2199, 12, 31, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One signed entry of a [`SigChain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigChainEntry {
    /// What this entry does
    pub entry_type: SigChainEntryType,
    /// Raw bytes of the key being added or removed
    pub subject_public_key: Vec<u8>,
    /// Raw bytes of the key that signed this entry
    pub signer_public_key: Vec<u8>,
    /// Hash of the previous entry (`None` for the first entry)
    pub parent_entry_hash: Option<[u8; 32]>,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// When the entry stops being valid
    pub expires_at: DateTime<Utc>,
    /// Signature over [`SigChainEntry::signed_data`]
    pub signature: Vec<u8>,
}

impl SigChainEntry {
    /// Bytes covered by the signature.
    ///
    /// type || len(subject) || subject || len(signer) || signer || parent || created || expires
    pub fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(128);
        data.push(self.entry_type.code());

        data.extend_from_slice(&(self.subject_public_key.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.subject_public_key);

        data.extend_from_slice(&(self.signer_public_key.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.signer_public_key);

        match &self.parent_entry_hash {
            Some(hash) => {
                data.push(1);
                data.extend_from_slice(hash);
            }
            None => data.push(0),
        }

        data.extend_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        data.extend_from_slice(&self.expires_at.timestamp_millis().to_le_bytes());
        data
    }

    /// Hash identifying this entry: BLAKE3 over signed data and signature.
    pub fn entry_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signed_data());
        hasher.update(&self.signature);
        *hasher.finalize().as_bytes()
    }

    /// Verify the entry signature against its declared signer.
    pub fn verify_signature(&self) -> GroupResult<bool> {
        let signer = PubKey::from_bytes(&self.signer_public_key)?;
        signer.verify(&self.signed_data(), &self.signature)
    }

    fn sign(&mut self, key: &PrivKey) {
        self.signature = key.sign(&self.signed_data());
    }
}

/// Append-only ledger of key-authorization events for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigChain {
    entries: Vec<SigChainEntry>,
}

impl SigChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from stored entries, validating custody.
    pub fn from_entries(entries: Vec<SigChainEntry>) -> GroupResult<Self> {
        let chain = Self { entries };
        chain.check()?;
        Ok(chain)
    }

    /// All entries in append order.
    pub fn list_entries(&self) -> &[SigChainEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has no entry yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `InitChain` entry.
    pub fn get_initial_entry(&self) -> GroupResult<&SigChainEntry> {
        let first = self
            .entries
            .first()
            .ok_or(GroupError::SigChainFirstEntryMissing)?;

        if first.entry_type != SigChainEntryType::InitChain {
            return Err(GroupError::SigChainInvalidFirstEntry);
        }
        Ok(first)
    }

    /// The most recent entry, if any.
    pub fn get_last_entry(&self) -> Option<&SigChainEntry> {
        self.entries.last()
    }

    /// Keys currently valid: added (or initial) keys minus later removals.
    ///
    /// Entries whose subject key cannot be decoded are skipped.
    pub fn list_current_pub_keys(&self) -> HashSet<PubKey> {
        replay_keys(&self.entries)
    }

    /// Whether `key` is currently valid.
    pub fn is_key_currently_present(&self, key: &PubKey) -> bool {
        self.list_current_pub_keys().contains(key)
    }

    /// Start the chain with a self-signed `InitChain` entry.
    pub fn init(&mut self, key: &PrivKey) -> GroupResult<SigChainEntry> {
        if !self.entries.is_empty() {
            return Err(GroupError::SigChainAlreadyInitialized);
        }
        self.append_entry(key, SigChainEntryType::InitChain, key.public())
    }

    /// Authorize `subject`, signed by a currently valid key.
    pub fn add_entry(&mut self, signer: &PrivKey, subject: &PubKey) -> GroupResult<SigChainEntry> {
        if self.entries.is_empty() {
            return Err(GroupError::SigChainNotInitialized);
        }
        let keys = self.list_current_pub_keys();
        if !keys.contains(&signer.public()) {
            return Err(GroupError::SigChainNotAllowed("add"));
        }
        if keys.contains(subject) {
            return Err(GroupError::SigChainKeyAlreadyListed);
        }
        self.append_entry(signer, SigChainEntryType::AddKey, *subject)
    }

    /// Revoke `subject`, signed by a currently valid key.
    pub fn remove_entry(&mut self, signer: &PrivKey, subject: &PubKey) -> GroupResult<SigChainEntry> {
        if self.entries.is_empty() {
            return Err(GroupError::SigChainNotInitialized);
        }
        let keys = self.list_current_pub_keys();
        if !keys.contains(&signer.public()) {
            return Err(GroupError::SigChainNotAllowed("remove"));
        }
        if !keys.contains(subject) {
            return Err(GroupError::SigChainKeyNotListed);
        }
        self.append_entry(signer, SigChainEntryType::RemoveKey, *subject)
    }

    /// Validate chain of custody over every entry.
    ///
    /// Checks, entry by entry: the first entry is a self-signed `InitChain`
    /// and no later entry is; parent hashes link consecutive entries; every
    /// signature verifies; every signer was valid right before its entry.
    pub fn check(&self) -> GroupResult<()> {
        let corrupted = |index: usize, reason: &str| GroupError::SigChainCorrupted {
            index,
            reason: reason.to_string(),
        };

        self.get_initial_entry()?;

        let mut valid: HashSet<PubKey> = HashSet::new();
        let mut parent: Option<[u8; 32]> = None;

        for (index, entry) in self.entries.iter().enumerate() {
            if entry.parent_entry_hash != parent {
                return Err(corrupted(index, "parent hash does not match previous entry"));
            }

            let signer = PubKey::from_bytes(&entry.signer_public_key)
                .map_err(|_| corrupted(index, "signer key cannot be decoded"))?;
            if !entry.verify_signature().unwrap_or(false) {
                return Err(corrupted(index, "signature does not verify"));
            }

            match entry.entry_type {
                SigChainEntryType::InitChain => {
                    if index != 0 {
                        return Err(corrupted(index, "InitChain after the first entry"));
                    }
                    if entry.subject_public_key != entry.signer_public_key {
                        return Err(corrupted(index, "InitChain is not self-signed"));
                    }
                }
                SigChainEntryType::AddKey | SigChainEntryType::RemoveKey => {
                    if !valid.contains(&signer) {
                        return Err(corrupted(index, "signer was not valid at signing time"));
                    }
                }
            }

            apply_entry(&mut valid, entry);
            parent = Some(entry.entry_hash());
        }

        Ok(())
    }

    fn append_entry(
        &mut self,
        signer: &PrivKey,
        entry_type: SigChainEntryType,
        subject: PubKey,
    ) -> GroupResult<SigChainEntry> {
        let mut entry = SigChainEntry {
            entry_type,
            subject_public_key: subject.to_bytes(),
            signer_public_key: signer.public().to_bytes(),
            parent_entry_hash: self.get_last_entry().map(SigChainEntry::entry_hash),
            created_at: Utc::now(),
            expires_at: far_future(),
            signature: Vec::new(),
        };
        entry.sign(signer);

        if !entry.verify_signature()? {
            return Err(GroupError::Crypto("freshly signed entry does not verify".to_string()));
        }

        self.entries.push(entry.clone());
        Ok(entry)
    }
}

fn apply_entry(keys: &mut HashSet<PubKey>, entry: &SigChainEntry) {
    let Ok(subject) = PubKey::from_bytes(&entry.subject_public_key) else {
        return;
    };
    match entry.entry_type {
        SigChainEntryType::RemoveKey => {
            keys.remove(&subject);
        }
        SigChainEntryType::InitChain | SigChainEntryType::AddKey => {
            keys.insert(subject);
        }
    }
}

fn replay_keys(entries: &[SigChainEntry]) -> HashSet<PubKey> {
    let mut keys = HashSet::new();
    for entry in entries {
        apply_entry(&mut keys, entry);
    }
    keys
}
