//! box2: the symmetric envelope behind groups and HKDF-keyed DMs.
//!
//! Key tree (all HKDF-Expand-SHA256, SLP-encoded infos):
//!
//! ```text
//! SharedSecret / GroupKey
//!  └─> SlotKey ("slot_key", author, previous)
//! MessageKey (random per message)
//!  └─> ReadKey ("read_key")
//!       ├─> HeaderKey ("header_key")
//!       └─> BodyKey ("body_key")
//! ```
//!
//! Layout: `header_box(32) ‖ n×slot(48) ‖ body_box`. The 16-byte header
//! carries the body offset; every internal box uses a zero nonce since
//! each key is used exactly once. Decryption trial-opens slot windows
//! with every candidate key.

use scuttle_crypto::hkdf::{derive_to, encode_slp, hkdf_sha256};
use scuttle_crypto::secretbox::{self, TAG_LEN};
use scuttle_crypto::signing::KeyPair;
use scuttle_types::{FeedRef, MessageRef, Result, ScuttleError};

/// Maximum number of key slots per envelope.
pub const MAX_SLOTS: usize = 16;

/// Sealed header: 16 plaintext bytes + tag.
const HEADER_LEN: usize = 16 + TAG_LEN;

/// Sealed key slot: 32 key bytes + tag.
const SLOT_LEN: usize = 32 + TAG_LEN;

/// Fixed salt for direct-message key derivation.
const DM_SALT: &[u8] = b"scuttle-box2-dm-v1";

const ZERO_NONCE: [u8; secretbox::NONCE_LEN] = [0u8; secretbox::NONCE_LEN];

/// Seals `plaintext` for every key in `recipient_keys`.
///
/// `author` and `previous` bind the slots to their position in the
/// author's feed; decryption must present the same pair.
pub fn encrypt(
    plaintext: &[u8],
    author: &FeedRef,
    previous: Option<&MessageRef>,
    recipient_keys: &[[u8; 32]],
) -> Result<Vec<u8>> {
    if recipient_keys.is_empty() || recipient_keys.len() > MAX_SLOTS {
        return Err(ScuttleError::Crypto {
            reason: format!(
                "box2 takes 1..={MAX_SLOTS} recipient keys, got {}",
                recipient_keys.len()
            ),
        });
    }

    let msg_key = secretbox::generate_key();
    let read_key = derive_to(&msg_key, &[b"read_key"])?;
    let header_key = derive_to(read_key.as_bytes(), &[b"header_key"])?;
    let body_key = derive_to(read_key.as_bytes(), &[b"body_key"])?;

    let body_offset = HEADER_LEN + recipient_keys.len() * SLOT_LEN;
    let mut header_plain = [0u8; 16];
    header_plain[..2].copy_from_slice(&(body_offset as u16).to_le_bytes());

    let mut out = Vec::with_capacity(body_offset + plaintext.len() + TAG_LEN);
    out.extend_from_slice(&secretbox::seal(header_key.as_bytes(), &ZERO_NONCE, &header_plain)?);

    for recipient_key in recipient_keys {
        let slot_key = slot_key_for(recipient_key, author, previous)?;
        out.extend_from_slice(&secretbox::seal(slot_key.as_bytes(), &ZERO_NONCE, &msg_key)?);
    }

    out.extend_from_slice(&secretbox::seal(body_key.as_bytes(), &ZERO_NONCE, plaintext)?);
    Ok(out)
}

/// Attempts to open a box2 envelope with each candidate key.
///
/// Returns `None` when no candidate opens any slot, the normal outcome
/// for group traffic we hold no key for.
pub fn decrypt(
    ciphertext: &[u8],
    author: &FeedRef,
    previous: Option<&MessageRef>,
    candidate_keys: &[[u8; 32]],
) -> Option<Vec<u8>> {
    if ciphertext.len() < HEADER_LEN + SLOT_LEN {
        return None;
    }
    let header_box = &ciphertext[..HEADER_LEN];

    for candidate in candidate_keys {
        let Ok(slot_key) = slot_key_for(candidate, author, previous) else {
            continue;
        };
        let max_slots = ((ciphertext.len() - HEADER_LEN) / SLOT_LEN).min(MAX_SLOTS);
        for i in 0..max_slots {
            let start = HEADER_LEN + i * SLOT_LEN;
            let slot = &ciphertext[start..start + SLOT_LEN];
            let Ok(opened) = secretbox::open(slot_key.as_bytes(), &ZERO_NONCE, slot) else {
                continue;
            };
            if opened.len() != 32 {
                continue;
            }
            let mut msg_key = [0u8; 32];
            msg_key.copy_from_slice(&opened);

            let Some(plain) = open_with_msg_key(&msg_key, header_box, ciphertext) else {
                continue;
            };
            return Some(plain);
        }
    }
    None
}

fn open_with_msg_key(msg_key: &[u8; 32], header_box: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let read_key = derive_to(msg_key, &[b"read_key"]).ok()?;
    let header_key = derive_to(read_key.as_bytes(), &[b"header_key"]).ok()?;
    let header = secretbox::open(header_key.as_bytes(), &ZERO_NONCE, header_box).ok()?;
    if header.len() != 16 {
        return None;
    }
    let body_offset = u16::from_le_bytes([header[0], header[1]]) as usize;
    if body_offset < HEADER_LEN + SLOT_LEN || body_offset >= ciphertext.len() {
        return None;
    }
    let body_key = derive_to(read_key.as_bytes(), &[b"body_key"]).ok()?;
    secretbox::open(body_key.as_bytes(), &ZERO_NONCE, &ciphertext[body_offset..]).ok()
}

fn slot_key_for(
    recipient_key: &[u8; 32],
    author: &FeedRef,
    previous: Option<&MessageRef>,
) -> Result<scuttle_crypto::hkdf::DerivedKey> {
    let author_bytes = author.stored_bytes();
    let prev_bytes = previous.map(|p| p.stored_bytes().to_vec()).unwrap_or_default();
    derive_to(recipient_key, &[b"slot_key", &author_bytes, &prev_bytes])
}

/// Derives the pairwise direct-message key for `ours` and `their`.
///
/// The X25519 shared secret is run through HKDF with a fixed salt and
/// the *sorted* pair of feed identities, so both parties derive the
/// identical key.
pub fn derive_dm_key(ours: &KeyPair, their: &FeedRef) -> Result<[u8; 32]> {
    let shared = scuttle_crypto::ecdh::shared_secret_with(ours, their.public_key())?;

    let our_id = ours.id().stored_bytes();
    let their_id = their.stored_bytes();
    let (lo, hi) = if our_id <= their_id {
        (our_id, their_id)
    } else {
        (their_id, our_id)
    };

    let info = encode_slp(Vec::new(), &[b"direct-message", &lo, &hi]);
    let derived = hkdf_sha256(shared.as_bytes(), DM_SALT, &info)?;
    Ok(*derived.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
