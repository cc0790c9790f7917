//! Identity keys for members, devices and groups
//!
//! Every participant key in the protocol is an Ed25519 keypair:
//!
//! - **Member keys**: long-lived identity of a group member
//! - **Device keys**: one per device, authorized by the member key
//! - **Group keys**: the group's own identity, its public half is the group id
//!
//! The same Ed25519 keys are converted to X25519 when a device secret is sealed
//! for a destination member (see [`crate::crypto::SealedSecret`]).
//!
//! ## Example
//!
//! ```rust
//! use groupsync_core::identity::PrivKey;
//!
//! let member = PrivKey::generate();
//! let signature = member.sign(b"hello group");
//!
//! assert!(member.public().verify(b"hello group", &signature).unwrap());
//! ```

mod keys;

pub use keys::{key_id, PrivKey, PubKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
