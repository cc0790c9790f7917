//! Metadata log: membership, devices, admins and secret distribution
//!
//! - [`GroupMetadataEvent`]: closed set of events carried by the log
//! - [`MetadataStoreIndex`]: replays the log into current group state
//! - [`MetadataStore`]: appends new events

mod event;
mod index;
mod store;

pub use event::{
    AdminRoleGranted, DeviceSecretAdded, GroupMetadataEvent, InitialMemberAnnounced,
    MemberDeviceAdded,
};
pub use index::{IndexSnapshot, MetadataStoreIndex, StoreIndex, UpdateSummary};
pub use store::MetadataStore;
