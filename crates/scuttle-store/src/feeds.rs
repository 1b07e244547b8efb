//! Feed store: validated ingestion into the receive log and the
//! per-author multilog.
//!
//! Appends for a single author are serialized behind a per-author lock
//! so tip resolution and chain validation cannot race; appends across
//! authors proceed in parallel. The receive log is durable before the
//! author sublog is updated; the tips tree is written last.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use scuttle_codec::{peek_author, verify_raw, FeedTip, Message};
use scuttle_types::{FeedRef, MessageRef, ReceiveSeq, Result, ScuttleError};

use crate::multilog::{feed_addr, Multilog};
use crate::receive_log::{LogEntry, ReceiveLog};

/// Name the user-feeds multilog is opened under.
pub const USER_FEEDS: &str = "userFeeds";

/// Validated message ingestion over the receive log.
pub struct FeedStore {
    log: Arc<ReceiveLog>,
    user_feeds: Multilog,
    tips: sled::Tree,
    hmac: Option<[u8; 32]>,
    author_locks: Mutex<HashMap<FeedRef, Arc<Mutex<()>>>>,
}

impl FeedStore {
    /// Creates the feed store over an open receive log and the
    /// user-feeds multilog. `tips_db` hosts the per-feed tip tree.
    pub fn new(
        log: Arc<ReceiveLog>,
        user_feeds: Multilog,
        tips_db: &sled::Db,
        hmac: Option<[u8; 32]>,
    ) -> Result<Arc<Self>> {
        let tips = tips_db.open_tree("tips").map_err(|e| ScuttleError::Fatal {
            reason: format!("failed to open tips tree: {e}"),
        })?;
        Ok(Arc::new(Self {
            log,
            user_feeds,
            tips,
            hmac,
            author_locks: Mutex::new(HashMap::new()),
        }))
    }

    /// The receive log behind this store.
    pub fn log(&self) -> &Arc<ReceiveLog> {
        &self.log
    }

    /// The user-feeds multilog.
    pub fn user_feeds(&self) -> &Multilog {
        &self.user_feeds
    }

    /// Validates raw message bytes and ingests them.
    ///
    /// Returns the message reference on success. Validation failures
    /// reject the message without touching the stores.
    pub async fn append_raw(&self, raw: &[u8]) -> Result<MessageRef> {
        let author = peek_author(raw)?;
        let guard = self.author_lock(&author).await;
        let _held = guard.lock().await;

        let tip = self.tip(&author)?;
        let msg = verify_raw(raw, tip.as_ref(), self.hmac.as_ref())?;
        self.ingest_locked(&msg)?;
        Ok(msg.key())
    }

    /// Ingests an already validated message (an own publish).
    ///
    /// Re-checks the chain against the stored tip under the author lock
    /// so concurrent publishes cannot fork the feed.
    pub async fn append_message(&self, msg: &Message) -> Result<ReceiveSeq> {
        let guard = self.author_lock(&msg.author()).await;
        let _held = guard.lock().await;

        let tip = self.tip(&msg.author())?;
        let expected = tip.as_ref().map(|t| t.sequence + 1).unwrap_or(1);
        if msg.sequence() != expected {
            return Err(ScuttleError::SequenceGap {
                author: msg.author().to_string(),
                expected,
                got: msg.sequence(),
            });
        }
        self.ingest_locked(msg)
    }

    fn ingest_locked(&self, msg: &Message) -> Result<ReceiveSeq> {
        let seq = self.log.append(msg)?;
        self.user_feeds.append(&feed_addr(&msg.author()), seq)?;
        self.tips
            .insert(msg.author().stored_bytes(), encode_tip(&msg.as_tip()))
            .map_err(storage_err)?;
        Ok(seq)
    }

    /// Latest validated sequence and message reference of a feed.
    pub fn tip(&self, feed: &FeedRef) -> Result<Option<FeedTip>> {
        match self.tips.get(feed.stored_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode_tip(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Looks up a message by reference.
    pub fn get(&self, key: &MessageRef) -> Result<Message> {
        self.log
            .get_by_ref(key)?
            .map(|(_, m)| m)
            .ok_or_else(|| ScuttleError::NotFound {
                what: format!("message {key}"),
            })
    }

    /// True once any feed has at least one stored message.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.log.last_seq().is_none())
    }

    /// Lists every feed with stored messages.
    pub fn known_feeds(&self) -> Result<Vec<FeedRef>> {
        let mut out = Vec::new();
        for addr in self.user_feeds.addrs()? {
            out.push(FeedRef::from_stored_bytes(&addr)?);
        }
        Ok(out)
    }

    /// Rewrites every receive-log entry of `feed` to the nulled sentinel
    /// and forgets its tip. Sublog numbering is preserved; indexes skip
    /// nulled slots on rebuild.
    pub async fn null_feed(&self, feed: &FeedRef) -> Result<()> {
        let guard = self.author_lock(feed).await;
        let _held = guard.lock().await;

        let addr = feed_addr(feed);
        for seq in self.user_feeds.read_from(&addr, 0)? {
            self.log.null_entry(seq)?;
        }
        self.tips.remove(feed.stored_bytes()).map_err(storage_err)?;
        tracing::info!(feed = %feed, "feed nulled");
        Ok(())
    }

    /// Reads a feed's messages from `from_seq` (1-based author sequence)
    /// onward, skipping nulled slots.
    pub fn read_feed(&self, feed: &FeedRef, from_seq: u64) -> Result<Vec<Message>> {
        let addr = feed_addr(feed);
        let from_pos = from_seq.saturating_sub(1);
        let mut out = Vec::new();
        for seq in self.user_feeds.read_from(&addr, from_pos)? {
            if let Some(LogEntry::Message(m)) = self.log.get(seq)? {
                out.push(*m);
            }
        }
        Ok(out)
    }

    async fn author_lock(&self, author: &FeedRef) -> Arc<Mutex<()>> {
        let mut locks = self.author_locks.lock().await;
        locks.entry(*author).or_default().clone()
    }
}

fn storage_err(e: sled::Error) -> ScuttleError {
    ScuttleError::Storage {
        reason: format!("feed store: {e}"),
    }
}

fn encode_tip(tip: &FeedTip) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 33);
    out.extend_from_slice(&tip.sequence.to_be_bytes());
    out.extend_from_slice(&tip.key.stored_bytes());
    out
}

fn decode_tip(bytes: &[u8]) -> Result<FeedTip> {
    if bytes.len() != 41 {
        return Err(ScuttleError::Corrupt {
            index: "tips".into(),
            reason: format!("tip record must be 41 bytes, got {}", bytes.len()),
        });
    }
    let mut seq_arr = [0u8; 8];
    seq_arr.copy_from_slice(&bytes[..8]);
    let algo = match bytes[8] {
        1 => scuttle_types::MsgAlgo::Sha256,
        2 => scuttle_types::MsgAlgo::Gabby,
        other => {
            return Err(ScuttleError::Corrupt {
                index: "tips".into(),
                reason: format!("unknown message algo tag {other}"),
            })
        }
    };
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[9..]);
    Ok(FeedTip {
        sequence: u64::from_be_bytes(seq_arr),
        key: MessageRef::new(algo, hash),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
