//! HKDF-SHA256 key derivation (RFC 5869).
//!
//! Two entry points: [`hkdf_sha256`] runs the full extract-and-expand
//! cycle and is used for direct-message keys; [`derive_to`] is the
//! expand-only step used throughout the envelope key tree, where the
//! input is already uniform key material. Info strings for the envelope
//! derivations are SLP-encoded lists (see [`encode_slp`]).

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use scuttle_types::{Result, ScuttleError};

// ---------------------------------------------------------------------------
// SLP encoding
// ---------------------------------------------------------------------------

/// Appends the SLP encoding of `list` to `out`: each element prefixed
/// with its little-endian `u16` length.
pub fn encode_slp(mut out: Vec<u8>, list: &[&[u8]]) -> Vec<u8> {
    for elem in list {
        out.extend_from_slice(&(elem.len() as u16).to_le_bytes());
        out.extend_from_slice(elem);
    }
    out
}

// ---------------------------------------------------------------------------
// DerivedKey
// ---------------------------------------------------------------------------

/// A 32-byte derived key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    /// Wraps existing key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// DerivedKey does not implement Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Expand-only HKDF-SHA256: derives a 32-byte key from `key` with the
/// SLP-encoded `infos` list as the info parameter.
///
/// `key` must be at least 32 bytes of uniform key material.
pub fn derive_to(key: &[u8; 32], infos: &[&[u8]]) -> Result<DerivedKey> {
    let hk = Hkdf::<Sha256>::from_prk(key).map_err(|e| ScuttleError::Crypto {
        reason: format!("invalid key material for expand: {e}"),
    })?;
    let info = encode_slp(Vec::new(), infos);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm).map_err(|e| ScuttleError::Crypto {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })?;
    Ok(DerivedKey(okm))
}

/// Full HKDF-SHA256 extract-and-expand, producing 32 bytes.
///
/// An empty `salt` is valid per RFC 5869 §3.1 (treated as a zero-filled
/// salt of hash length).
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<DerivedKey> {
    let salt_opt: Option<&[u8]> = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).map_err(|e| ScuttleError::Crypto {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })?;
    Ok(DerivedKey(okm))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
