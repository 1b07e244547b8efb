//! Message content as a tagged union.
//!
//! Content on the wire is either a JSON object carrying a `type` field,
//! or a base64 string suffixed `.box` / `.box2` carrying an encrypted
//! envelope. Anything else is rejected at validation time.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use scuttle_types::{Result, ScuttleError};

/// Validated message content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Content {
    /// A cleartext JSON object (its `type` drives index dispatch).
    Clear(Value),
    /// A box1 (per-recipient sealed) envelope, decoded from base64.
    Box1(Vec<u8>),
    /// A box2 (symmetric, HKDF-keyed) envelope, decoded from base64.
    Box2(Vec<u8>),
}

impl Content {
    /// Classifies a raw content value.
    ///
    /// Objects pass as [`Content::Clear`]; strings must be base64 with a
    /// `.box` or `.box2` suffix; everything else is malformed.
    pub fn classify(value: &Value) -> Result<Self> {
        match value {
            Value::Object(_) => Ok(Self::Clear(value.clone())),
            Value::String(s) => {
                if let Some(b64) = s.strip_suffix(".box2") {
                    Ok(Self::Box2(decode_envelope(b64, ".box2")?))
                } else if let Some(b64) = s.strip_suffix(".box") {
                    Ok(Self::Box1(decode_envelope(b64, ".box")?))
                } else {
                    Err(ScuttleError::MalformedContent {
                        reason: "content string is not a .box/.box2 envelope".into(),
                    })
                }
            }
            other => Err(ScuttleError::MalformedContent {
                reason: format!("content must be an object or envelope string, got {other}"),
            }),
        }
    }

    /// Re-encodes this content as the wire-level JSON value.
    pub fn to_wire_value(&self) -> Value {
        match self {
            Self::Clear(v) => v.clone(),
            Self::Box1(bytes) => Value::String(format!("{}.box", B64.encode(bytes))),
            Self::Box2(bytes) => Value::String(format!("{}.box2", B64.encode(bytes))),
        }
    }

    /// The `type` field of cleartext content, if present.
    pub fn type_str(&self) -> Option<&str> {
        match self {
            Self::Clear(Value::Object(map)) => map.get("type").and_then(Value::as_str),
            _ => None,
        }
    }

    /// True for box1/box2 envelopes.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::Clear(_))
    }
}

fn decode_envelope(b64: &str, suffix: &str) -> Result<Vec<u8>> {
    B64.decode(b64).map_err(|e| ScuttleError::MalformedContent {
        reason: format!("invalid base64 in {suffix} envelope: {e}"),
    })
}
