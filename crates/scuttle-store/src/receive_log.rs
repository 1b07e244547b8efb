//! The receive log: one globally ordered append-only log of every
//! validated message, regardless of author.
//!
//! Entries are keyed by their 64-bit receive sequence (big-endian, so
//! sled's lexicographic iteration is receive order). A side tree maps
//! message references to receive sequences for O(log n) `get`. Appends
//! are broadcast to subscribers (indexers, live streams, the
//! replicator's debounce).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use scuttle_codec::Message;
use scuttle_types::{MessageRef, ReceiveSeq, Result, ScuttleError};

/// Buffered appends per subscriber before a slow consumer lags.
const BROADCAST_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// One slot of the receive log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogEntry {
    /// A validated message.
    Message(Box<Message>),
    /// The slot's feed was nulled; downstream consumers skip this.
    /// The slot keeps its receive sequence so numbering is preserved.
    Nulled,
}

impl LogEntry {
    /// Returns the message, or `None` for a nulled slot.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(m) => Some(m),
            Self::Nulled => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiveLog
// ---------------------------------------------------------------------------

/// Append-only log of all validated messages this node has accepted.
pub struct ReceiveLog {
    entries: sled::Tree,
    refs: sled::Tree,
    next_seq: AtomicU64,
    appends: broadcast::Sender<ReceiveSeq>,
}

impl ReceiveLog {
    /// Opens (or creates) the receive log inside `db`.
    pub fn open(db: &sled::Db) -> Result<Arc<Self>> {
        let entries = open_tree(db, "entries")?;
        let refs = open_tree(db, "refs")?;

        let next_seq = match entries.last().map_err(storage_err)? {
            Some((key, _)) => decode_seq(&key)? + 1,
            None => 1,
        };

        let (appends, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Arc::new(Self {
            entries,
            refs,
            next_seq: AtomicU64::new(next_seq),
            appends,
        }))
    }

    /// Appends a validated message and returns its receive sequence.
    ///
    /// The entry is flushed before the sequence is handed out; a message
    /// counts as ingested only once its receive sequence is stable.
    pub fn append(&self, msg: &Message) -> Result<ReceiveSeq> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = LogEntry::Message(Box::new(msg.clone()));

        self.entries
            .insert(seq.to_be_bytes(), encode_entry(&entry)?)
            .map_err(storage_err)?;
        self.refs
            .insert(msg.key().stored_bytes(), &seq.to_be_bytes())
            .map_err(storage_err)?;
        self.entries.flush().map_err(storage_err)?;

        // Receivers may lag and miss notifications; they re-read from
        // their cursor, so a dropped send is only a delayed wakeup.
        let _ = self.appends.send(seq);
        Ok(seq)
    }

    /// Reads the entry at `seq`.
    pub fn get(&self, seq: ReceiveSeq) -> Result<Option<LogEntry>> {
        match self.entries.get(seq.to_be_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Looks a message up by its reference.
    pub fn get_by_ref(&self, key: &MessageRef) -> Result<Option<(ReceiveSeq, Message)>> {
        let seq_bytes = match self.refs.get(key.stored_bytes()).map_err(storage_err)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let seq = decode_seq(&seq_bytes)?;
        match self.get(seq)? {
            Some(LogEntry::Message(m)) => Ok(Some((seq, *m))),
            _ => Ok(None),
        }
    }

    /// The highest receive sequence appended so far, if any.
    pub fn last_seq(&self) -> Option<ReceiveSeq> {
        let next = self.next_seq.load(Ordering::SeqCst);
        if next > 1 {
            Some(next - 1)
        } else {
            None
        }
    }

    /// Subscribes to append notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiveSeq> {
        self.appends.subscribe()
    }

    /// Reads entries with sequence in `[from, to]`, in order.
    pub fn range(&self, from: ReceiveSeq, to: ReceiveSeq) -> Result<Vec<(ReceiveSeq, LogEntry)>> {
        let mut out = Vec::new();
        for item in self.entries.range(from.to_be_bytes()..=to.to_be_bytes()) {
            let (key, value) = item.map_err(storage_err)?;
            out.push((decode_seq(&key)?, decode_entry(&value)?));
        }
        Ok(out)
    }

    /// Rewrites the entry at `seq` to the nulled sentinel and drops its
    /// message-ref index entry.
    pub fn null_entry(&self, seq: ReceiveSeq) -> Result<()> {
        if let Some(LogEntry::Message(m)) = self.get(seq)? {
            self.refs.remove(m.key().stored_bytes()).map_err(storage_err)?;
        }
        self.entries
            .insert(seq.to_be_bytes(), encode_entry(&LogEntry::Nulled)?)
            .map_err(storage_err)?;
        self.entries.flush().map_err(storage_err)?;
        Ok(())
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.entries.flush().map_err(storage_err)?;
        self.refs.flush().map_err(storage_err)?;
        Ok(())
    }
}

fn open_tree(db: &sled::Db, name: &str) -> Result<sled::Tree> {
    db.open_tree(name).map_err(|e| ScuttleError::Fatal {
        reason: format!("failed to open tree {name:?}: {e}"),
    })
}

fn storage_err(e: sled::Error) -> ScuttleError {
    ScuttleError::Storage {
        reason: format!("receive log: {e}"),
    }
}

fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(entry, &mut buf).map_err(|e| ScuttleError::Storage {
        reason: format!("failed to encode log entry: {e}"),
    })?;
    Ok(buf)
}

fn decode_entry(bytes: &[u8]) -> Result<LogEntry> {
    ciborium::from_reader(bytes).map_err(|e| ScuttleError::Corrupt {
        index: "receive-log".into(),
        reason: format!("undecodable entry: {e}"),
    })
}

fn decode_seq(bytes: &[u8]) -> Result<ReceiveSeq> {
    if bytes.len() != 8 {
        return Err(ScuttleError::Corrupt {
            index: "receive-log".into(),
            reason: format!("sequence key must be 8 bytes, got {}", bytes.len()),
        });
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
