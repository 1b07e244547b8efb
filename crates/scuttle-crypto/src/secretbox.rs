//! XSalsa20-Poly1305 secretbox and the signing HMAC transform.
//!
//! Both envelope formats build on NaCl secretbox. Nonces are 24 bytes;
//! envelope-internal boxes use a zero nonce because every key is used
//! exactly once.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;

use scuttle_types::{Result, ScuttleError};

/// Byte length of a secretbox nonce.
pub const NONCE_LEN: usize = 24;

/// Byte length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Generates a fresh 24-byte random nonce from OS entropy.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generates a fresh 32-byte random key from OS entropy.
pub fn generate_key() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Seals `plaintext` under `key` and `nonce`. Output is the ciphertext
/// with the 16-byte tag prepended by the cipher.
pub fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| ScuttleError::Crypto {
            reason: format!("secretbox seal failed: {e}"),
        })
}

/// Opens a secretbox produced by [`seal`]. Fails on any tampering or a
/// wrong key/nonce.
pub fn open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| ScuttleError::Crypto {
            reason: format!("secretbox open failed: {e}"),
        })
}

/// HMAC-SHA-512 truncated to 32 bytes.
///
/// This is the transform applied to canonical message bytes before
/// signing when an HMAC signing key is configured.
pub fn hmac_sha512_256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    // new_from_slice only fails on zero-length keys.
    let mut mac =
        <Hmac<Sha512> as Mac>::new_from_slice(key).expect("32-byte key is always valid");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&full[..32]);
    out
}
