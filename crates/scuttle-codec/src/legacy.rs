//! Signing, hashing and verification for the classic JSON format.
//!
//! The signable form is the canonical encoding of the unsigned message
//! (fields in the order `previous, author, sequence, timestamp, hash,
//! content`); when an HMAC signing key is configured the Ed25519
//! signature covers `HMAC(key, canonical_bytes)` instead. The message
//! hash is SHA-256 over the v8-binary squash of the canonical *signed*
//! encoding.

use serde_json::{Map, Number, Value};

use scuttle_crypto::hash::sha256;
use scuttle_crypto::secretbox::hmac_sha512_256;
use scuttle_crypto::signing::{self, KeyPair, Signature};
use scuttle_types::{FeedAlgo, FeedRef, MessageRef, MsgAlgo, Result, ScuttleError};

use crate::canonical;
use crate::content::Content;
use crate::message::Message;
use crate::{check_chain, FeedTip};

/// Hash algorithm marker carried in every classic message.
const HASH_FIELD: &str = "sha256";

/// Builds, signs and hashes a new classic message extending `tip`.
pub fn sign(
    keypair: &KeyPair,
    tip: Option<&FeedTip>,
    timestamp_ms: f64,
    content: &Content,
    hmac: Option<&[u8; 32]>,
) -> Result<Message> {
    if keypair.id().algo() != FeedAlgo::Classic {
        return Err(ScuttleError::Unsupported {
            reason: format!("classic sign with {} key", keypair.id()),
        });
    }

    let sequence = tip.map(|t| t.sequence + 1).unwrap_or(1);
    let previous = tip.map(|t| t.key);

    let mut map = Map::new();
    map.insert(
        "previous".into(),
        previous.map(|p| Value::String(p.to_string())).unwrap_or(Value::Null),
    );
    map.insert("author".into(), Value::String(keypair.id().to_string()));
    map.insert("sequence".into(), Value::Number(Number::from(sequence)));
    map.insert("timestamp".into(), number_from_f64(timestamp_ms)?);
    map.insert("hash".into(), Value::String(HASH_FIELD.into()));
    map.insert("content".into(), content.to_wire_value());

    let unsigned = canonical::encode(&Value::Object(map.clone()));
    let sig = sign_bytes(keypair, unsigned.as_bytes(), hmac);
    map.insert("signature".into(), Value::String(sig.to_wire_string()));

    let raw = canonical::encode(&Value::Object(map));
    let key = MessageRef::new(MsgAlgo::Sha256, sha256(&canonical::v8_binary(&raw)));

    Ok(Message::new(
        key,
        keypair.id(),
        sequence,
        previous,
        timestamp_ms,
        content.clone(),
        raw.into_bytes(),
    ))
}

/// Verifies raw classic message bytes against the author's stored tip.
///
/// Checks, in order: structural shape, supported formats, the hash
/// chain, and the Ed25519 signature. The returned [`Message`] carries
/// the canonical re-encoding as its raw form.
pub fn verify(raw: &[u8], tip: Option<&FeedTip>, hmac: Option<&[u8; 32]>) -> Result<Message> {
    let value = canonical::parse(raw)?;
    let map = match &value {
        Value::Object(map) => map,
        _ => {
            return Err(ScuttleError::MalformedContent {
                reason: "classic message must be a JSON object".into(),
            })
        }
    };

    let author: FeedRef = require_str(map, "author")?.parse()?;
    if author.algo() != FeedAlgo::Classic {
        return Err(ScuttleError::Unsupported {
            reason: format!("JSON message from non-classic author {author}"),
        });
    }

    let previous = match map.get("previous") {
        Some(Value::Null) | None => None,
        Some(Value::String(s)) => Some(s.parse::<MessageRef>()?),
        Some(other) => {
            return Err(ScuttleError::MalformedContent {
                reason: format!("previous must be null or a ref, got {other}"),
            })
        }
    };

    let sequence = require_u64(map, "sequence")?;
    if sequence < 1 {
        return Err(ScuttleError::MalformedContent {
            reason: "sequence must be >= 1".into(),
        });
    }

    let timestamp = match map.get("timestamp").and_then(Value::as_f64) {
        Some(t) => t,
        None => {
            return Err(ScuttleError::MalformedContent {
                reason: "timestamp must be a number".into(),
            })
        }
    };

    match map.get("hash") {
        Some(Value::String(h)) if h == HASH_FIELD => {}
        other => {
            return Err(ScuttleError::Unsupported {
                reason: format!("unsupported hash marker: {other:?}"),
            })
        }
    }

    let content_value = map.get("content").ok_or_else(|| ScuttleError::MalformedContent {
        reason: "missing content".into(),
    })?;
    let content = Content::classify(content_value)?;

    let sig = Signature::from_wire_string(require_str(map, "signature")?)?;

    check_chain(&author, sequence, previous.as_ref(), tip)?;

    // The hash covers the canonical signed encoding; the signature
    // covers the same encoding minus the signature field, preserving
    // the remaining field order.
    let raw_canonical = canonical::encode(&value);

    let mut unsigned = map.clone();
    unsigned.shift_remove("signature");
    let unsigned_bytes = canonical::encode(&Value::Object(unsigned));
    verify_bytes(&author, unsigned_bytes.as_bytes(), &sig, hmac)?;

    let key = MessageRef::new(MsgAlgo::Sha256, sha256(&canonical::v8_binary(&raw_canonical)));

    Ok(Message::new(
        key,
        author,
        sequence,
        previous,
        timestamp,
        content,
        raw_canonical.into_bytes(),
    ))
}

fn sign_bytes(keypair: &KeyPair, canonical_bytes: &[u8], hmac: Option<&[u8; 32]>) -> Signature {
    match hmac {
        Some(key) => keypair.sign(&hmac_sha512_256(key, canonical_bytes)),
        None => keypair.sign(canonical_bytes),
    }
}

fn verify_bytes(
    author: &FeedRef,
    canonical_bytes: &[u8],
    sig: &Signature,
    hmac: Option<&[u8; 32]>,
) -> Result<()> {
    match hmac {
        Some(key) => signing::verify(author, &hmac_sha512_256(key, canonical_bytes), sig),
        None => signing::verify(author, canonical_bytes, sig),
    }
}

fn require_str<'a>(map: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    map.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ScuttleError::MalformedContent {
            reason: format!("missing or non-string field {field:?}"),
        })
}

fn number_from_f64(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ScuttleError::MalformedContent {
            reason: format!("timestamp {f} is not a finite number"),
        })
}

fn require_u64(map: &Map<String, Value>, field: &str) -> Result<u64> {
    let v = map.get(field).ok_or_else(|| ScuttleError::MalformedContent {
        reason: format!("missing field {field:?}"),
    })?;
    if let Some(u) = v.as_u64() {
        return Ok(u);
    }
    // A legacy encoder may have round-tripped the sequence as a double.
    if let Some(f) = v.as_f64() {
        if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
            return Ok(f as u64);
        }
    }
    Err(ScuttleError::MalformedContent {
        reason: format!("field {field:?} must be an unsigned integer"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
