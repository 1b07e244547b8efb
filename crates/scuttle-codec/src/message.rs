//! The validated [`Message`] type and format dispatch.

use serde::{Deserialize, Serialize};

use scuttle_types::{FeedRef, MessageRef, Result, ScuttleError};

use crate::content::Content;
use crate::{gabby, legacy, FeedTip};

/// A fully validated message.
///
/// Construction goes through [`verify_raw`] (inbound) or the per-format
/// signers (own publishes), so holding a `Message` is proof that the
/// signature verified and the chain checks passed at ingestion time.
/// `raw` retains the canonical signed byte form so gossip re-serves
/// byte-identical messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    key: MessageRef,
    author: FeedRef,
    sequence: u64,
    previous: Option<MessageRef>,
    timestamp: f64,
    content: Content,
    raw: Vec<u8>,
}

impl Message {
    pub(crate) fn new(
        key: MessageRef,
        author: FeedRef,
        sequence: u64,
        previous: Option<MessageRef>,
        timestamp: f64,
        content: Content,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            key,
            author,
            sequence,
            previous,
            timestamp,
            content,
            raw,
        }
    }

    /// Content-derived reference of this message.
    pub fn key(&self) -> MessageRef {
        self.key
    }

    /// Author feed reference.
    pub fn author(&self) -> FeedRef {
        self.author
    }

    /// 1-based sequence within the author's feed.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Reference of the preceding message, `None` for the first.
    pub fn previous(&self) -> Option<MessageRef> {
        self.previous
    }

    /// Declared (untrusted) timestamp, milliseconds since epoch.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Validated content.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Canonical signed byte form, as served over gossip.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Tip value this message establishes for its author.
    pub fn as_tip(&self) -> FeedTip {
        FeedTip {
            sequence: self.sequence,
            key: self.key,
        }
    }
}

/// Validates raw message bytes in whichever format they arrive.
///
/// Classic messages are textual JSON objects; anything else is treated
/// as a gabby binary envelope.
pub fn verify_raw(raw: &[u8], tip: Option<&FeedTip>, hmac: Option<&[u8; 32]>) -> Result<Message> {
    let first = raw
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .ok_or_else(|| ScuttleError::MalformedContent {
            reason: "empty message".into(),
        })?;
    if *first == b'{' {
        legacy::verify(raw, tip, hmac)
    } else {
        gabby::verify(raw, tip, hmac)
    }
}

/// Extracts just the author from raw message bytes, without verifying.
///
/// Ingestion uses this to take the per-author lock before resolving the
/// tip and running full verification.
pub fn peek_author(raw: &[u8]) -> Result<FeedRef> {
    let first = raw
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .ok_or_else(|| ScuttleError::MalformedContent {
            reason: "empty message".into(),
        })?;
    if *first == b'{' {
        #[derive(Deserialize)]
        struct AuthorOnly {
            author: FeedRef,
        }
        let v: AuthorOnly = serde_json::from_slice(raw).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("invalid message JSON: {e}"),
        })?;
        Ok(v.author)
    } else {
        gabby::peek_author(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_crypto::signing::KeyPair;
    use serde_json::json;

    #[test]
    fn dispatches_on_leading_byte() -> Result<()> {
        let classic = KeyPair::from_seed(&[0x01; 32]);
        let content = Content::Clear(json!({"type": "test"}));
        let msg = legacy::sign(&classic, None, 1000.0, &content, None)?;
        let verified = verify_raw(msg.raw(), None, None)?;
        assert_eq!(verified.key(), msg.key());

        let gkp = KeyPair::from_seed_for(scuttle_types::FeedAlgo::Gabby, &[0x02; 32]);
        let gmsg = gabby::sign(&gkp, None, 1000.0, &content, None)?;
        let gverified = verify_raw(gmsg.raw(), None, None)?;
        assert_eq!(gverified.key(), gmsg.key());
        Ok(())
    }

    #[test]
    fn message_survives_storage_serialization() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let kp = KeyPair::from_seed(&[0x03; 32]);
        let msg = legacy::sign(&kp, None, 42.0, &Content::Clear(json!({"type": "t"})), None)?;

        let mut buf = Vec::new();
        ciborium::into_writer(&msg, &mut buf)?;
        let back: Message = ciborium::from_reader(buf.as_slice())?;
        assert_eq!(back.key(), msg.key());
        assert_eq!(back.raw(), msg.raw());
        Ok(())
    }
}
