//! The gabby binary feed format.
//!
//! A gabby message is a two-entry CBOR envelope: the canonically
//! encoded event (`previous, author, sequence, timestamp, content`) as
//! a byte string, and the Ed25519 signature over those event bytes. The
//! message hash is SHA-256 of the whole envelope encoding.

use ciborium::value::Value as Cbor;

use scuttle_crypto::hash::sha256;
use scuttle_crypto::secretbox::hmac_sha512_256;
use scuttle_crypto::signing::{self, KeyPair, Signature};
use scuttle_types::{FeedAlgo, FeedRef, MessageRef, MsgAlgo, Result, ScuttleError};

use crate::content::Content;
use crate::message::Message;
use crate::{check_chain, FeedTip};

/// Builds, signs and hashes a new gabby message extending `tip`.
pub fn sign(
    keypair: &KeyPair,
    tip: Option<&FeedTip>,
    timestamp_ms: f64,
    content: &Content,
    hmac: Option<&[u8; 32]>,
) -> Result<Message> {
    if keypair.id().algo() != FeedAlgo::Gabby {
        return Err(ScuttleError::Unsupported {
            reason: format!("gabby sign with {} key", keypair.id()),
        });
    }

    let sequence = tip.map(|t| t.sequence + 1).unwrap_or(1);
    let previous = tip.map(|t| t.key);

    let content_bytes =
        serde_json::to_vec(&content.to_wire_value()).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("content encoding failed: {e}"),
        })?;

    let event = Cbor::Map(vec![
        (
            Cbor::Text("previous".into()),
            previous
                .map(|p| Cbor::Bytes(p.stored_bytes().to_vec()))
                .unwrap_or(Cbor::Null),
        ),
        (
            Cbor::Text("author".into()),
            Cbor::Bytes(keypair.id().stored_bytes().to_vec()),
        ),
        (Cbor::Text("sequence".into()), Cbor::Integer(sequence.into())),
        (
            Cbor::Text("timestamp".into()),
            Cbor::Integer((timestamp_ms as i64).into()),
        ),
        (Cbor::Text("content".into()), Cbor::Bytes(content_bytes)),
    ]);
    let event_bytes = encode_cbor(&event)?;

    let sig = match hmac {
        Some(key) => keypair.sign(&hmac_sha512_256(key, &event_bytes)),
        None => keypair.sign(&event_bytes),
    };

    let envelope = Cbor::Map(vec![
        (Cbor::Text("event".into()), Cbor::Bytes(event_bytes)),
        (Cbor::Text("signature".into()), Cbor::Bytes(sig.as_bytes().to_vec())),
    ]);
    let raw = encode_cbor(&envelope)?;
    let key = MessageRef::new(MsgAlgo::Gabby, sha256(&raw));

    Ok(Message::new(
        key,
        keypair.id(),
        sequence,
        previous,
        timestamp_ms,
        content.clone(),
        raw,
    ))
}

/// Verifies a raw gabby envelope against the author's stored tip.
pub fn verify(raw: &[u8], tip: Option<&FeedTip>, hmac: Option<&[u8; 32]>) -> Result<Message> {
    let envelope: Cbor = ciborium::from_reader(raw).map_err(|e| ScuttleError::MalformedContent {
        reason: format!("invalid gabby envelope: {e}"),
    })?;
    let entries = match &envelope {
        Cbor::Map(entries) => entries,
        _ => {
            return Err(ScuttleError::MalformedContent {
                reason: "gabby envelope must be a CBOR map".into(),
            })
        }
    };

    let event_bytes = require_bytes(entries, "event")?;
    let sig_bytes = require_bytes(entries, "signature")?;
    if sig_bytes.len() != Signature::LEN {
        return Err(ScuttleError::BadSignature {
            reason: format!("expected 64 signature bytes, got {}", sig_bytes.len()),
        });
    }
    let mut sig_arr = [0u8; 64];
    sig_arr.copy_from_slice(sig_bytes);
    let sig = Signature::from_bytes(sig_arr);

    let event: Cbor =
        ciborium::from_reader(event_bytes.as_slice()).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("invalid gabby event: {e}"),
        })?;
    let fields = match &event {
        Cbor::Map(fields) => fields,
        _ => {
            return Err(ScuttleError::MalformedContent {
                reason: "gabby event must be a CBOR map".into(),
            })
        }
    };

    let author = FeedRef::from_stored_bytes(require_bytes(fields, "author")?)?;
    if author.algo() != FeedAlgo::Gabby {
        return Err(ScuttleError::Unsupported {
            reason: format!("gabby envelope from non-gabby author {author}"),
        });
    }

    let previous = match lookup(fields, "previous") {
        Some(Cbor::Null) | None => None,
        Some(Cbor::Bytes(b)) => {
            if b.len() != 33 {
                return Err(ScuttleError::MalformedContent {
                    reason: format!("previous must be 33 bytes, got {}", b.len()),
                });
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&b[1..]);
            let algo = match b[0] {
                1 => MsgAlgo::Sha256,
                2 => MsgAlgo::Gabby,
                other => {
                    return Err(ScuttleError::MalformedContent {
                        reason: format!("unknown message algo tag {other}"),
                    })
                }
            };
            Some(MessageRef::new(algo, hash))
        }
        Some(other) => {
            return Err(ScuttleError::MalformedContent {
                reason: format!("previous must be null or bytes, got {other:?}"),
            })
        }
    };

    let sequence = require_u64(fields, "sequence")?;
    if sequence < 1 {
        return Err(ScuttleError::MalformedContent {
            reason: "sequence must be >= 1".into(),
        });
    }
    let timestamp = require_u64(fields, "timestamp").map(|t| t as f64).or_else(|_| {
        require_i64(fields, "timestamp").map(|t| t as f64)
    })?;

    let content_bytes = require_bytes(fields, "content")?;
    let content_value: serde_json::Value =
        serde_json::from_slice(content_bytes).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("gabby content is not valid JSON: {e}"),
        })?;
    let content = Content::classify(&content_value)?;

    check_chain(&author, sequence, previous.as_ref(), tip)?;

    match hmac {
        Some(key) => signing::verify(&author, &hmac_sha512_256(key, event_bytes), &sig)?,
        None => signing::verify(&author, event_bytes, &sig)?,
    }

    let key = MessageRef::new(MsgAlgo::Gabby, sha256(raw));

    Ok(Message::new(
        key,
        author,
        sequence,
        previous,
        timestamp,
        content,
        raw.to_vec(),
    ))
}

/// Extracts just the author from a raw gabby envelope.
pub fn peek_author(raw: &[u8]) -> Result<FeedRef> {
    let envelope: Cbor = ciborium::from_reader(raw).map_err(|e| ScuttleError::MalformedContent {
        reason: format!("invalid gabby envelope: {e}"),
    })?;
    let entries = match &envelope {
        Cbor::Map(entries) => entries,
        _ => {
            return Err(ScuttleError::MalformedContent {
                reason: "gabby envelope must be a CBOR map".into(),
            })
        }
    };
    let event_bytes = require_bytes(entries, "event")?;
    let event: Cbor =
        ciborium::from_reader(event_bytes.as_slice()).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("invalid gabby event: {e}"),
        })?;
    match &event {
        Cbor::Map(fields) => FeedRef::from_stored_bytes(require_bytes(fields, "author")?),
        _ => Err(ScuttleError::MalformedContent {
            reason: "gabby event must be a CBOR map".into(),
        }),
    }
}

fn encode_cbor(value: &Cbor) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ScuttleError::MalformedContent {
        reason: format!("CBOR encoding failed: {e}"),
    })?;
    Ok(buf)
}

fn lookup<'a>(entries: &'a [(Cbor, Cbor)], key: &str) -> Option<&'a Cbor> {
    entries.iter().find_map(|(k, v)| match k {
        Cbor::Text(s) if s == key => Some(v),
        _ => None,
    })
}

fn require_bytes<'a>(entries: &'a [(Cbor, Cbor)], key: &str) -> Result<&'a Vec<u8>> {
    match lookup(entries, key) {
        Some(Cbor::Bytes(b)) => Ok(b),
        _ => Err(ScuttleError::MalformedContent {
            reason: format!("missing or non-bytes field {key:?}"),
        }),
    }
}

fn require_u64(entries: &[(Cbor, Cbor)], key: &str) -> Result<u64> {
    match lookup(entries, key) {
        Some(Cbor::Integer(i)) => u64::try_from(*i).map_err(|_| ScuttleError::MalformedContent {
            reason: format!("field {key:?} out of range"),
        }),
        _ => Err(ScuttleError::MalformedContent {
            reason: format!("missing or non-integer field {key:?}"),
        }),
    }
}

fn require_i64(entries: &[(Cbor, Cbor)], key: &str) -> Result<i64> {
    match lookup(entries, key) {
        Some(Cbor::Integer(i)) => i64::try_from(*i).map_err(|_| ScuttleError::MalformedContent {
            reason: format!("field {key:?} out of range"),
        }),
        _ => Err(ScuttleError::MalformedContent {
            reason: format!("missing or non-integer field {key:?}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
