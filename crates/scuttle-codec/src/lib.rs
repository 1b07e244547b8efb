//! Message codecs for the classic (JSON) and gabby (binary) feed formats.
//!
//! Both formats carry the same logical fields (author, sequence,
//! previous, timestamp, content, signature); this crate owns their
//! canonical byte forms, signing, hashing, and verification. Everything
//! downstream of ingestion works with the validated [`Message`] type.

pub mod canonical;
pub mod content;
pub mod gabby;
pub mod legacy;
pub mod message;

pub use content::Content;
pub use message::{peek_author, verify_raw, Message};

use scuttle_types::{MessageRef, Result};

/// Looks up local key material to open encrypted content.
///
/// Implemented by the private-message layer; consumed by the indexer
/// sinks that need the decrypted view (by-type, privates, group members).
pub trait ContentUnboxer: Send + Sync {
    /// Attempts to decrypt the message's content with every locally held
    /// key. Returns the plaintext on success, `None` when no key fits.
    fn unbox(&self, msg: &Message) -> Option<Vec<u8>>;
}

/// Tip of an author's feed: its latest sequence and message reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FeedTip {
    /// Latest validated sequence number.
    pub sequence: u64,
    /// Reference of the message at that sequence.
    pub key: MessageRef,
}

/// Convenience wrapper: verifies that `previous`/`sequence` of a parsed
/// message extend the given tip.
pub(crate) fn check_chain(
    author: &scuttle_types::FeedRef,
    sequence: u64,
    previous: Option<&MessageRef>,
    tip: Option<&FeedTip>,
) -> Result<()> {
    use scuttle_types::ScuttleError;

    let expected_seq = tip.map(|t| t.sequence + 1).unwrap_or(1);
    if sequence != expected_seq {
        return Err(ScuttleError::SequenceGap {
            author: author.to_string(),
            expected: expected_seq,
            got: sequence,
        });
    }
    match (tip, previous) {
        (None, None) => Ok(()),
        (Some(t), Some(p)) if t.key == *p => Ok(()),
        (Some(t), got) => Err(ScuttleError::BrokenChain {
            author: author.to_string(),
            expected: t.key.to_string(),
            got: got.map(|p| p.to_string()).unwrap_or_else(|| "null".into()),
        }),
        (None, Some(p)) => Err(ScuttleError::BrokenChain {
            author: author.to_string(),
            expected: "null".into(),
            got: p.to_string(),
        }),
    }
}
