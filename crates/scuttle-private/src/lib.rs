//! Private-message cryptography: per-recipient sealed envelopes (box1),
//! symmetric HKDF-keyed envelopes (box2), the symmetric key store, and
//! the group manager built on top of them.

pub mod box1;
pub mod box2;
pub mod groups;
pub mod keys;

pub use groups::{CloakedId, GroupManager};
pub use keys::{KeyScheme, KeyStore, StoredKey};
