//! Core shared types for the scuttle gossip-log workspace.
//!
//! This crate defines the identifier types used across every other crate
//! (feeds, messages, blobs), their wire-string encodings, the central
//! error type, and the node configuration. No other crate should define
//! shared types; everything lives here.

pub mod config;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Globally ordered position in the receive log.
pub type ReceiveSeq = u64;

// ---------------------------------------------------------------------------
// FeedAlgo
// ---------------------------------------------------------------------------

/// Feed format algorithm, encoded as the suffix of a feed reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum FeedAlgo {
    /// Classic JSON feed format (`.ed25519`).
    Classic,
    /// Gabby-grove binary feed format (`.ggfeed-v1`).
    Gabby,
}

impl FeedAlgo {
    /// Wire suffix for this algorithm.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Classic => "ed25519",
            Self::Gabby => "ggfeed-v1",
        }
    }
}

// ---------------------------------------------------------------------------
// FeedRef
// ---------------------------------------------------------------------------

/// Identity of an author: a feed algorithm plus its Ed25519 public key.
///
/// Wire form: `@<base64(pubkey)>.ed25519` (classic) or
/// `@<base64(pubkey)>.ggfeed-v1` (gabby).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FeedRef {
    algo: FeedAlgo,
    key: [u8; 32],
}

impl FeedRef {
    /// The fixed byte length of the public key.
    pub const KEY_LEN: usize = 32;

    /// Creates a feed reference from an algorithm and raw public key.
    pub fn new(algo: FeedAlgo, key: [u8; 32]) -> Self {
        Self { algo, key }
    }

    /// Returns the feed algorithm.
    pub fn algo(&self) -> FeedAlgo {
        self.algo
    }

    /// Returns the raw public key bytes.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Returns the stable storage encoding: one algorithm tag byte
    /// followed by the 32 key bytes. Used as sublog address and sled key.
    pub fn stored_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = match self.algo {
            FeedAlgo::Classic => 1,
            FeedAlgo::Gabby => 2,
        };
        out[1..].copy_from_slice(&self.key);
        out
    }

    /// Inverse of [`stored_bytes`](Self::stored_bytes).
    pub fn from_stored_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 33 {
            return Err(ScuttleError::MalformedRef {
                reason: format!("stored feed ref must be 33 bytes, got {}", bytes.len()),
            });
        }
        let algo = match bytes[0] {
            1 => FeedAlgo::Classic,
            2 => FeedAlgo::Gabby,
            other => {
                return Err(ScuttleError::MalformedRef {
                    reason: format!("unknown feed algo tag {other}"),
                })
            }
        };
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[1..]);
        Ok(Self { algo, key })
    }
}

impl PartialOrd for FeedRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeedRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.algo.cmp(&other.algo))
    }
}

impl fmt::Display for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", B64.encode(self.key), self.algo.suffix())
    }
}

impl FromStr for FeedRef {
    type Err = ScuttleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s.strip_prefix('@').ok_or_else(|| ScuttleError::MalformedRef {
            reason: format!("feed ref must start with '@': {s:?}"),
        })?;
        let (b64, algo) = if let Some(b) = rest.strip_suffix(".ed25519") {
            (b, FeedAlgo::Classic)
        } else if let Some(b) = rest.strip_suffix(".ggfeed-v1") {
            (b, FeedAlgo::Gabby)
        } else {
            return Err(ScuttleError::MalformedRef {
                reason: format!("unknown feed ref suffix: {s:?}"),
            });
        };
        let key = decode_32(b64, "feed ref")?;
        Ok(Self { algo, key })
    }
}

impl Serialize for FeedRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FeedRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// MessageRef
// ---------------------------------------------------------------------------

/// Message hash algorithm, encoded as the suffix of a message reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MsgAlgo {
    /// SHA-256 over the canonical classic encoding (`.sha256`).
    Sha256,
    /// SHA-256 over the gabby binary envelope (`.ggmsg-v1`).
    Gabby,
}

impl MsgAlgo {
    /// Wire suffix for this algorithm.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Gabby => "ggmsg-v1",
        }
    }
}

/// Identity of a message: content-derived hash plus its algorithm.
///
/// Wire form: `%<base64(hash)>.sha256` or `%<base64(hash)>.ggmsg-v1`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MessageRef {
    algo: MsgAlgo,
    hash: [u8; 32],
}

impl MessageRef {
    /// The fixed byte length of the hash.
    pub const HASH_LEN: usize = 32;

    /// Creates a message reference from an algorithm and raw hash.
    pub fn new(algo: MsgAlgo, hash: [u8; 32]) -> Self {
        Self { algo, hash }
    }

    /// Returns the hash algorithm.
    pub fn algo(&self) -> MsgAlgo {
        self.algo
    }

    /// Returns the raw hash bytes.
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Stable storage encoding: algorithm tag byte plus hash bytes.
    pub fn stored_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = match self.algo {
            MsgAlgo::Sha256 => 1,
            MsgAlgo::Gabby => 2,
        };
        out[1..].copy_from_slice(&self.hash);
        out
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}.{}", B64.encode(self.hash), self.algo.suffix())
    }
}

impl FromStr for MessageRef {
    type Err = ScuttleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s.strip_prefix('%').ok_or_else(|| ScuttleError::MalformedRef {
            reason: format!("message ref must start with '%': {s:?}"),
        })?;
        let (b64, algo) = if let Some(b) = rest.strip_suffix(".sha256") {
            (b, MsgAlgo::Sha256)
        } else if let Some(b) = rest.strip_suffix(".ggmsg-v1") {
            (b, MsgAlgo::Gabby)
        } else {
            return Err(ScuttleError::MalformedRef {
                reason: format!("unknown message ref suffix: {s:?}"),
            });
        };
        let hash = decode_32(b64, "message ref")?;
        Ok(Self { algo, hash })
    }
}

impl Serialize for MessageRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// BlobRef
// ---------------------------------------------------------------------------

/// Identity of a blob: the SHA-256 digest of its content.
///
/// Wire form: `&<base64(hash)>.sha256`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BlobRef([u8; 32]);

impl BlobRef {
    /// The fixed byte length of the digest.
    pub const HASH_LEN: usize = 32;

    /// Creates a blob reference from a raw SHA-256 digest.
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns the raw digest bytes.
    pub fn hash(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}.sha256", B64.encode(self.0))
    }
}

impl FromStr for BlobRef {
    type Err = ScuttleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s.strip_prefix('&').ok_or_else(|| ScuttleError::MalformedRef {
            reason: format!("blob ref must start with '&': {s:?}"),
        })?;
        let b64 = rest.strip_suffix(".sha256").ok_or_else(|| ScuttleError::MalformedRef {
            reason: format!("blob ref must end with '.sha256': {s:?}"),
        })?;
        Ok(Self(decode_32(b64, "blob ref")?))
    }
}

impl Serialize for BlobRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decodes a base64 payload that must carry exactly 32 bytes.
fn decode_32(b64: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = B64.decode(b64).map_err(|e| ScuttleError::MalformedRef {
        reason: format!("{what}: invalid base64: {e}"),
    })?;
    if bytes.len() != 32 {
        return Err(ScuttleError::MalformedRef {
            reason: format!("{what}: expected 32 bytes, got {}", bytes.len()),
        });
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// ---------------------------------------------------------------------------
// ScuttleError
// ---------------------------------------------------------------------------

/// Central error type for the scuttle workspace.
///
/// All crates convert their internal errors into variants of this enum.
/// Validation variants reject a single message and never take the peer
/// down; only the top-level supervisor decides fatality.
#[derive(Debug, Error)]
pub enum ScuttleError {
    /// A reference string or stored reference is malformed.
    #[error("malformed ref: {reason}")]
    MalformedRef {
        /// Why the reference could not be parsed.
        reason: String,
    },

    /// An Ed25519 signature did not verify over the canonical bytes.
    #[error("bad signature: {reason}")]
    BadSignature {
        /// Which check failed.
        reason: String,
    },

    /// A message's `previous` does not match the stored prior tip.
    #[error("broken chain for {author}: expected {expected}, got {got}")]
    BrokenChain {
        /// The author whose chain broke.
        author: String,
        /// The tip the store holds.
        expected: String,
        /// The `previous` the message claimed.
        got: String,
    },

    /// A message's sequence is not exactly `tip + 1`.
    #[error("sequence gap for {author}: expected {expected}, got {got}")]
    SequenceGap {
        /// The author whose sequence jumped.
        author: String,
        /// The sequence the store expected.
        expected: u64,
        /// The sequence the message claimed.
        got: u64,
    },

    /// The message uses a feed or hash format this node cannot handle.
    #[error("unsupported format: {reason}")]
    Unsupported {
        /// What was not supported.
        reason: String,
    },

    /// Message content is neither a typed JSON object nor an envelope.
    #[error("malformed content: {reason}")]
    MalformedContent {
        /// Why the content was rejected.
        reason: String,
    },

    /// The requested blob, message or feed does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// A cryptographic operation failed (key derivation, unboxing, sealing).
    #[error("crypto error: {reason}")]
    Crypto {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A storage operation failed; retried or escalated by the caller.
    #[error("storage error: {reason}")]
    Storage {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A derived index is inconsistent and must be rebuilt from the log.
    #[error("corrupt index {index}: {reason}")]
    Corrupt {
        /// Name of the affected index.
        index: String,
        /// What was inconsistent.
        reason: String,
    },

    /// The remote peer is not admitted by the replication policy.
    #[error("unauthorized: {remote}")]
    Unauthorized {
        /// Wire string of the rejected peer.
        remote: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// The node cannot continue; recorded and followed by shutdown.
    #[error("fatal: {reason}")]
    Fatal {
        /// Last error before shutdown.
        reason: String,
    },
}

impl ScuttleError {
    /// True for the per-message validation kinds that reject the message
    /// without disconnecting the peer.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::BadSignature { .. }
                | Self::BrokenChain { .. }
                | Self::SequenceGap { .. }
                | Self::Unsupported { .. }
                | Self::MalformedContent { .. }
        )
    }
}

/// Convenience result type using [`ScuttleError`].
pub type Result<T> = std::result::Result<T, ScuttleError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
