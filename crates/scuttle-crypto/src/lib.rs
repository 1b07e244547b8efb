//! Cryptographic primitives for the scuttle workspace.
//!
//! Ed25519 signing and the on-disk key pair, SHA-2 hashing, HKDF-SHA256
//! derivation, X25519 key agreement with Ed25519 conversion, and the
//! XSalsa20-Poly1305 secretbox used by the private-message envelopes.

pub mod ecdh;
pub mod hash;
pub mod hkdf;
pub mod secretbox;
pub mod signing;
