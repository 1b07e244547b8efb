//! box1: the per-recipient sealed envelope.
//!
//! Layout: `nonce(24) ‖ ephemeral_pk(32) ‖ n×slot(49) ‖ body`, with up
//! to seven recipient slots. Each slot seals `count(1) ‖ msg_key(32)`
//! under the X25519 shared secret between a one-shot ephemeral key and
//! the recipient's Curve25519-converted feed key; the body is sealed
//! under the message key. Unboxing trial-opens every slot.

use scuttle_crypto::ecdh;
use scuttle_crypto::secretbox::{self, NONCE_LEN, TAG_LEN};
use scuttle_crypto::signing::KeyPair;
use scuttle_types::{FeedRef, Result, ScuttleError};

/// Maximum number of recipient slots.
pub const MAX_RECIPIENTS: usize = 7;

/// Size of one sealed key slot: 1 count byte + 32 key bytes + tag.
const SLOT_LEN: usize = 1 + 32 + TAG_LEN;

/// Offset of the first slot: nonce + ephemeral public key.
const SLOTS_START: usize = NONCE_LEN + 32;

/// Seals `plaintext` to up to seven recipient feeds.
pub fn encrypt(plaintext: &[u8], recipients: &[FeedRef]) -> Result<Vec<u8>> {
    if recipients.is_empty() || recipients.len() > MAX_RECIPIENTS {
        return Err(ScuttleError::Crypto {
            reason: format!(
                "box1 takes 1..={MAX_RECIPIENTS} recipients, got {}",
                recipients.len()
            ),
        });
    }

    let nonce = secretbox::generate_nonce();
    let eph_sk = secretbox::generate_key();
    let eph_pk = ecdh::curve_public_key(&eph_sk);
    let msg_key = secretbox::generate_key();

    let mut slot_plain = [0u8; 33];
    slot_plain[0] = recipients.len() as u8;
    slot_plain[1..].copy_from_slice(&msg_key);

    let mut out = Vec::with_capacity(
        SLOTS_START + recipients.len() * SLOT_LEN + plaintext.len() + TAG_LEN,
    );
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&eph_pk);

    for recipient in recipients {
        let curve_pk = ecdh::ed25519_pk_to_curve(recipient.public_key())?;
        let shared = ecdh::scalar_mult(&eph_sk, &curve_pk);
        let slot = secretbox::seal(shared.as_bytes(), &nonce, &slot_plain)?;
        out.extend_from_slice(&slot);
    }

    let body = secretbox::seal(&msg_key, &nonce, plaintext)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Attempts to open a box1 envelope with the local key pair.
///
/// Returns `None` when no slot opens for this key; this is the normal
/// outcome for messages addressed to someone else.
pub fn decrypt(ciphertext: &[u8], keypair: &KeyPair) -> Option<Vec<u8>> {
    if ciphertext.len() < SLOTS_START + SLOT_LEN {
        return None;
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&ciphertext[..NONCE_LEN]);
    let mut eph_pk = [0u8; 32];
    eph_pk.copy_from_slice(&ciphertext[NONCE_LEN..SLOTS_START]);

    let my_sk = ecdh::ed25519_sk_to_curve(keypair);
    let shared = ecdh::scalar_mult(&my_sk, &eph_pk);

    let max_slots = ((ciphertext.len() - SLOTS_START) / SLOT_LEN).min(MAX_RECIPIENTS);
    for i in 0..max_slots {
        let start = SLOTS_START + i * SLOT_LEN;
        let slot = &ciphertext[start..start + SLOT_LEN];
        let Ok(opened) = secretbox::open(shared.as_bytes(), &nonce, slot) else {
            continue;
        };
        if opened.len() != 33 {
            continue;
        }
        let count = opened[0] as usize;
        if count == 0 || count > MAX_RECIPIENTS {
            continue;
        }
        let body_start = SLOTS_START + count * SLOT_LEN;
        if body_start > ciphertext.len() {
            continue;
        }
        let mut msg_key = [0u8; 32];
        msg_key.copy_from_slice(&opened[1..]);
        if let Ok(plain) = secretbox::open(&msg_key, &nonce, &ciphertext[body_start..]) {
            return Some(plain);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
