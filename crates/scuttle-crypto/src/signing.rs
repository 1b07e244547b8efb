//! Ed25519 digital signatures and the on-disk key pair.
//!
//! Provides keypair generation, message signing, signature verification,
//! and loading/storing the `secret` file. The private key is zeroized on
//! drop via `ed25519-dalek`'s built-in `ZeroizeOnDrop`.

use std::fs;
use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use scuttle_types::{FeedAlgo, FeedRef, Result, ScuttleError};

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Fixed byte length of an Ed25519 signature.
    pub const LEN: usize = 64;

    /// Creates a [`Signature`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying 64-byte array.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Wire encoding: `<base64(sig)>.sig.ed25519`.
    pub fn to_wire_string(&self) -> String {
        format!("{}.sig.ed25519", B64.encode(self.0))
    }

    /// Parses the wire encoding produced by [`to_wire_string`](Self::to_wire_string).
    pub fn from_wire_string(s: &str) -> Result<Self> {
        let b64 = s.strip_suffix(".sig.ed25519").ok_or_else(|| ScuttleError::BadSignature {
            reason: format!("signature must end with '.sig.ed25519': {s:?}"),
        })?;
        let bytes = B64.decode(b64).map_err(|e| ScuttleError::BadSignature {
            reason: format!("invalid signature base64: {e}"),
        })?;
        if bytes.len() != Self::LEN {
            return Err(ScuttleError::BadSignature {
                reason: format!("expected 64 signature bytes, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// KeyPair
// ---------------------------------------------------------------------------

/// Ed25519 signing keypair bound to a feed format.
///
/// Wraps an `ed25519-dalek` [`SigningKey`]; the secret half is zeroized
/// when this struct is dropped.
pub struct KeyPair {
    /// `pub(crate)` so [`crate::ecdh`] can convert to X25519 without
    /// exposing the seed to external callers.
    pub(crate) signing_key: SigningKey,
    id: FeedRef,
}

impl KeyPair {
    /// Generates a new random classic-format keypair from OS entropy.
    pub fn generate() -> Self {
        Self::generate_for(FeedAlgo::Classic)
    }

    /// Generates a new random keypair for the given feed format.
    pub fn generate_for(algo: FeedAlgo) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let id = FeedRef::new(algo, signing_key.verifying_key().to_bytes());
        Self { signing_key, id }
    }

    /// Reconstructs a classic keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_seed_for(FeedAlgo::Classic, seed)
    }

    /// Reconstructs a keypair deterministically from a seed, for the given
    /// feed format.
    pub fn from_seed_for(algo: FeedAlgo, seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let id = FeedRef::new(algo, signing_key.verifying_key().to_bytes());
        Self { signing_key, id }
    }

    /// Returns the feed reference of this identity.
    pub fn id(&self) -> FeedRef {
        self.id
    }

    /// Returns the public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Signs an arbitrary byte slice. Deterministic per RFC 8032.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

// KeyPair intentionally does not implement Clone or Debug to prevent
// accidental leakage of the private key in logs or copies.

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verifies an Ed25519 signature against an author's public key.
pub fn verify(author: &FeedRef, message: &[u8], signature: &Signature) -> Result<()> {
    let vk = VerifyingKey::from_bytes(author.public_key()).map_err(|e| {
        ScuttleError::BadSignature {
            reason: format!("invalid public key: {e}"),
        }
    })?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    vk.verify_strict(message, &sig).map_err(|e| ScuttleError::BadSignature {
        reason: format!("signature verification failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Secret file
// ---------------------------------------------------------------------------

/// On-disk layout of the `secret` file.
///
/// `private` holds the 64-byte seed-plus-public encoding; `id` and
/// `public` are the derived wire strings and are validated on load.
#[derive(Serialize, Deserialize)]
struct SecretFile {
    curve: String,
    id: String,
    public: String,
    private: String,
}

/// Loads the keypair from `path`, creating and persisting a fresh one if
/// the file does not exist.
pub fn load_or_create(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        load(path)
    } else {
        let kp = KeyPair::generate();
        store(path, &kp)?;
        Ok(kp)
    }
}

/// Loads and validates the keypair from the `secret` file at `path`.
pub fn load(path: &Path) -> Result<KeyPair> {
    let raw = fs::read_to_string(path).map_err(|e| ScuttleError::Storage {
        reason: format!("failed to read secret file {path:?}: {e}"),
    })?;
    let sf: SecretFile = serde_json::from_str(&raw).map_err(|e| ScuttleError::Storage {
        reason: format!("malformed secret file {path:?}: {e}"),
    })?;

    if sf.curve != "ed25519" {
        return Err(ScuttleError::Unsupported {
            reason: format!("unsupported secret curve {:?}", sf.curve),
        });
    }

    let priv_b64 = sf.private.strip_suffix(".ed25519").unwrap_or(&sf.private);
    let priv_bytes = B64.decode(priv_b64).map_err(|e| ScuttleError::Storage {
        reason: format!("invalid private key base64: {e}"),
    })?;
    if priv_bytes.len() != 64 {
        return Err(ScuttleError::Storage {
            reason: format!("expected 64 private key bytes, got {}", priv_bytes.len()),
        });
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&priv_bytes[..32]);
    let kp = KeyPair::from_seed(&seed);

    let claimed: FeedRef = sf.id.parse()?;
    if claimed != kp.id() {
        return Err(ScuttleError::Storage {
            reason: format!("secret file id {} does not match derived key {}", claimed, kp.id()),
        });
    }
    Ok(kp)
}

/// Persists `kp` to the `secret` file at `path` with owner-only permissions.
pub fn store(path: &Path, kp: &KeyPair) -> Result<()> {
    let mut full = [0u8; 64];
    full[..32].copy_from_slice(&kp.signing_key.to_bytes());
    full[32..].copy_from_slice(&kp.public_key());

    let sf = SecretFile {
        curve: "ed25519".into(),
        id: kp.id().to_string(),
        public: format!("{}.ed25519", B64.encode(kp.public_key())),
        private: format!("{}.ed25519", B64.encode(full)),
    };
    let json = serde_json::to_string_pretty(&sf).map_err(|e| ScuttleError::Storage {
        reason: format!("failed to encode secret file: {e}"),
    })?;

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path).map_err(|e| ScuttleError::Storage {
        reason: format!("failed to create secret file {path:?}: {e}"),
    })?;
    f.write_all(json.as_bytes()).map_err(|e| ScuttleError::Storage {
        reason: format!("failed to write secret file: {e}"),
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
