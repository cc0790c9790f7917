//! Groupsync Core Library
//!
//! Secure group replication over append-only logs.
//!
//! ## Overview
//!
//! A group is a set of members, each owning one or more devices. Every group
//! has two replicated logs:
//!
//! - the **metadata log**, carrying membership, device registration, admin
//!   grants and device secrets
//! - the **message log**, carrying messages encrypted under each device's own
//!   chain key ratchet
//!
//! Entries are encrypted with a key derived from the group secret and signed
//! by the authoring device. Each replica rebuilds group state by replaying the
//! metadata log into a [`MetadataStoreIndex`]; replay is idempotent and does
//! not depend on the order in which entries of different devices arrive.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use groupsync_core::{Group, GroupConfig, GroupContext, MemoryLog, OwnMemberDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (group, group_key) = Group::generate();
//!     let ctx = GroupContext::open(
//!         group,
//!         OwnMemberDevice::generate(),
//!         Arc::new(MemoryLog::new()),
//!         GroupConfig::from_env()?,
//!     )
//!     .await?;
//!
//!     ctx.metadata_store().announce_initial_member(&group_key).await?;
//!     ctx.message_store().add_message(b"hello").await?;
//!
//!     ctx.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod events;
pub mod group;
pub mod identity;
pub mod invitation;
pub mod keystore;
pub mod log;
pub mod logging;
pub mod member_store;
pub mod message;
pub mod metadata;
pub mod sigchain;

// Re-exports
pub use config::GroupConfig;
pub use context::GroupContext;
pub use envelope::{GroupEnvelope, ENVELOPE_VERSION};
pub use error::{GroupError, GroupResult};
pub use events::{EventEmitter, EventSubscription, GroupEvent, MetadataNotification};
pub use group::{Group, GroupId, MemberDevice, OwnMemberDevice};
pub use identity::{PrivKey, PubKey};
pub use invitation::{Invitation, InvitationProof};
pub use keystore::SignedEntryKeyStore;
pub use log::{
    EntryHash, EntryRef, GroupLogBinding, LogAddress, LogEntry, LogKind, LogSubstrate, MemoryLog,
};
pub use member_store::MemberStore;
pub use message::{
    ChainId, DeviceChainKey, GroupMessageEvent, MessageItem, MessageIter, MessageKeys, MessageStore,
};
pub use metadata::{
    GroupMetadataEvent, IndexSnapshot, MetadataStore, MetadataStoreIndex, StoreIndex,
    UpdateSummary,
};
pub use sigchain::{SigChain, SigChainEntry, SigChainEntryType};
