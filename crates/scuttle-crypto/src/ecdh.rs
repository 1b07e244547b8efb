//! X25519 key agreement and Ed25519 → Curve25519 conversion.
//!
//! The envelope formats address recipients by their Ed25519 feed keys,
//! so sealing to a third party needs the public-only Edwards→Montgomery
//! conversion, and unboxing needs the secret-side conversion through
//! `SHA-512(seed)`.

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use scuttle_types::{Result, ScuttleError};

use crate::signing::KeyPair;

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Shared secret from an X25519 exchange (32 bytes), zeroized on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Returns the raw shared secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// SharedSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Converts an Ed25519 public key to its X25519 (Montgomery) form.
///
/// Fails if the bytes do not decode to a curve point.
pub fn ed25519_pk_to_curve(ed_pk: &[u8; 32]) -> Result<[u8; 32]> {
    let point = CompressedEdwardsY(*ed_pk)
        .decompress()
        .ok_or_else(|| ScuttleError::Crypto {
            reason: "ed25519 public key is not a valid curve point".into(),
        })?;
    Ok(point.to_montgomery().to_bytes())
}

/// Converts an Ed25519 keypair's secret half to an X25519 secret scalar:
/// the lower 32 bytes of `SHA-512(seed)`. Clamping is performed by the
/// scalar multiplication.
pub fn ed25519_sk_to_curve(keypair: &KeyPair) -> [u8; 32] {
    let mut seed = keypair.signing_key.to_bytes();
    let hash = Sha512::digest(&seed);
    seed.zeroize();

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    secret
}

// ---------------------------------------------------------------------------
// Key agreement
// ---------------------------------------------------------------------------

/// X25519 scalar multiplication of a raw secret with a Montgomery point.
pub fn scalar_mult(secret: &[u8; 32], point: &[u8; 32]) -> SharedSecret {
    SharedSecret(x25519_dalek::x25519(*secret, *point))
}

/// Derives the X25519 shared secret between our Ed25519 keypair and a
/// peer's Ed25519 public key.
pub fn shared_secret_with(ours: &KeyPair, their_ed_pk: &[u8; 32]) -> Result<SharedSecret> {
    let mut our_curve_sk = ed25519_sk_to_curve(ours);
    let their_curve_pk = ed25519_pk_to_curve(their_ed_pk)?;
    let shared = scalar_mult(&our_curve_sk, &their_curve_pk);
    our_curve_sk.zeroize();
    Ok(shared)
}

/// Derives the X25519 public key matching [`ed25519_sk_to_curve`].
pub fn curve_public_key(secret: &[u8; 32]) -> [u8; 32] {
    let sk = x25519_dalek::StaticSecret::from(*secret);
    x25519_dalek::PublicKey::from(&sk).to_bytes()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converted_public_matches_converted_secret() -> scuttle_types::Result<()> {
        // The Montgomery form reached through the public-only path must
        // equal the one derived from the secret scalar.
        let kp = KeyPair::from_seed(&[0x42; 32]);
        let via_public = ed25519_pk_to_curve(&kp.public_key())?;
        let via_secret = curve_public_key(&ed25519_sk_to_curve(&kp));
        assert_eq!(via_public, via_secret);
        Ok(())
    }

    #[test]
    fn shared_secret_is_symmetric() -> scuttle_types::Result<()> {
        let alice = KeyPair::from_seed(&[0x01; 32]);
        let bob = KeyPair::from_seed(&[0x02; 32]);

        let ab = shared_secret_with(&alice, &bob.public_key())?;
        let ba = shared_secret_with(&bob, &alice.public_key())?;
        assert_eq!(ab.as_bytes(), ba.as_bytes());
        Ok(())
    }

    #[test]
    fn different_peers_different_secrets() -> scuttle_types::Result<()> {
        let alice = KeyPair::from_seed(&[0x01; 32]);
        let bob = KeyPair::from_seed(&[0x02; 32]);
        let carol = KeyPair::from_seed(&[0x03; 32]);

        let ab = shared_secret_with(&alice, &bob.public_key())?;
        let ac = shared_secret_with(&alice, &carol.public_key())?;
        assert_ne!(ab.as_bytes(), ac.as_bytes());
        Ok(())
    }

    #[test]
    fn invalid_point_rejected() {
        // Not every 32-byte string decompresses to a curve point.
        let mut bad = [0xFFu8; 32];
        bad[31] = 0x7F;
        let mut found_invalid = false;
        for b in 0..=255u8 {
            bad[0] = b;
            if ed25519_pk_to_curve(&bad).is_err() {
                found_invalid = true;
                break;
            }
        }
        assert!(found_invalid);
    }
}
