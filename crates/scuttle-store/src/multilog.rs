//! Multilogs: keyed projections of the receive log.
//!
//! A multilog maps addresses (author, content type, tangle root, …) to
//! ordered sequences of receive sequences. Entries are stored under
//! composite keys `len(addr) ‖ addr ‖ position` so one prefix scan
//! yields one sublog in order; a side tree tracks per-sublog lengths.

use std::sync::Arc;

use tokio::sync::Notify;

use scuttle_types::{ReceiveSeq, Result, ScuttleError};

/// Address of one sublog within a multilog.
pub type Addr = Vec<u8>;

// ---------------------------------------------------------------------------
// MultilogSet
// ---------------------------------------------------------------------------

/// Opens named multilogs inside one sled database.
pub struct MultilogSet {
    db: sled::Db,
}

impl MultilogSet {
    /// Wraps the multilog database.
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Opens (or creates) the multilog called `name`.
    pub fn open(&self, name: &str) -> Result<Multilog> {
        let entries = self
            .db
            .open_tree(format!("m:{name}"))
            .map_err(|e| ScuttleError::Fatal {
                reason: format!("failed to open multilog {name:?}: {e}"),
            })?;
        let lens = self
            .db
            .open_tree(format!("l:{name}"))
            .map_err(|e| ScuttleError::Fatal {
                reason: format!("failed to open multilog lengths {name:?}: {e}"),
            })?;
        Ok(Multilog {
            name: name.to_string(),
            entries,
            lens,
            appended: Arc::new(Notify::new()),
        })
    }
}

// ---------------------------------------------------------------------------
// Multilog
// ---------------------------------------------------------------------------

/// One multilog: a family of sublogs, each an ordered list of receive
/// sequences.
#[derive(Clone)]
pub struct Multilog {
    name: String,
    entries: sled::Tree,
    lens: sled::Tree,
    appended: Arc<Notify>,
}

impl Multilog {
    /// Name this multilog was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `seq` to the sublog at `addr`, returning its position.
    pub fn append(&self, addr: &[u8], seq: ReceiveSeq) -> Result<u64> {
        let pos = self.len(addr)?;
        self.entries
            .insert(entry_key(addr, pos), &seq.to_be_bytes())
            .map_err(|e| self.storage_err(e))?;
        self.lens
            .insert(addr, &(pos + 1).to_be_bytes())
            .map_err(|e| self.storage_err(e))?;
        self.appended.notify_waiters();
        Ok(pos)
    }

    /// Appends `seq` unless it is already the sublog's last entry.
    ///
    /// Sink indexes re-process the item at their cursor after a crash;
    /// this keeps that replay from duplicating the tail entry.
    pub fn append_unique(&self, addr: &[u8], seq: ReceiveSeq) -> Result<u64> {
        let len = self.len(addr)?;
        if len > 0 {
            if let Some(last) = self.get(addr, len - 1)? {
                if last == seq {
                    return Ok(len - 1);
                }
            }
        }
        self.append(addr, seq)
    }

    /// Last receive sequence of the sublog at `addr`, if any.
    pub fn last(&self, addr: &[u8]) -> Result<Option<ReceiveSeq>> {
        let len = self.len(addr)?;
        if len == 0 {
            return Ok(None);
        }
        self.get(addr, len - 1)
    }

    /// Shared append signal for missed-wakeup-free waiting.
    ///
    /// Register interest (`signal.notified()`) before re-checking the
    /// sublog length, then await the registered future.
    pub fn append_signal(&self) -> Arc<Notify> {
        self.appended.clone()
    }

    /// Number of entries in the sublog at `addr`.
    pub fn len(&self, addr: &[u8]) -> Result<u64> {
        match self.lens.get(addr).map_err(|e| self.storage_err(e))? {
            Some(bytes) => decode_u64(&self.name, &bytes),
            None => Ok(0),
        }
    }

    /// Reads the receive sequence at `pos` of the sublog at `addr`.
    pub fn get(&self, addr: &[u8], pos: u64) -> Result<Option<ReceiveSeq>> {
        match self
            .entries
            .get(entry_key(addr, pos))
            .map_err(|e| self.storage_err(e))?
        {
            Some(bytes) => Ok(Some(decode_u64(&self.name, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads the sublog at `addr` from `from_pos` onward.
    pub fn read_from(&self, addr: &[u8], from_pos: u64) -> Result<Vec<ReceiveSeq>> {
        let len = self.len(addr)?;
        let mut out = Vec::new();
        for pos in from_pos..len {
            match self.get(addr, pos)? {
                Some(seq) => out.push(seq),
                None => {
                    return Err(ScuttleError::Corrupt {
                        index: self.name.clone(),
                        reason: format!("hole at position {pos}"),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Lists every sublog address with at least one entry.
    pub fn addrs(&self) -> Result<Vec<Addr>> {
        let mut out = Vec::new();
        for item in self.lens.iter() {
            let (key, _) = item.map_err(|e| self.storage_err(e))?;
            out.push(key.to_vec());
        }
        Ok(out)
    }

    /// Waits until some sublog of this multilog receives an append.
    ///
    /// Callers must re-check their condition after waking; the
    /// notification carries no address.
    pub async fn wait_for_append(&self) {
        self.appended.notified().await;
    }

    /// Flushes pending writes.
    pub fn flush(&self) -> Result<()> {
        self.entries.flush().map_err(|e| self.storage_err(e))?;
        self.lens.flush().map_err(|e| self.storage_err(e))?;
        Ok(())
    }

    fn storage_err(&self, e: sled::Error) -> ScuttleError {
        ScuttleError::Storage {
            reason: format!("multilog {}: {e}", self.name),
        }
    }
}

fn entry_key(addr: &[u8], pos: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + addr.len() + 8);
    key.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    key.extend_from_slice(addr);
    key.extend_from_slice(&pos.to_be_bytes());
    key
}

fn decode_u64(name: &str, bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(ScuttleError::Corrupt {
            index: name.to_string(),
            reason: format!("expected 8-byte value, got {}", bytes.len()),
        });
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// Common addresses
// ---------------------------------------------------------------------------

/// Sublog address of an author feed.
pub fn feed_addr(feed: &scuttle_types::FeedRef) -> Addr {
    feed.stored_bytes().to_vec()
}

/// Sublog address of a content type.
pub fn type_addr(content_type: &str) -> Addr {
    let mut addr = b"string:".to_vec();
    addr.extend_from_slice(content_type.as_bytes());
    addr
}

/// Sublog address of a tangle root.
pub fn tangle_addr(root: &scuttle_types::MessageRef) -> Addr {
    root.stored_bytes().to_vec()
}

/// Sublog address of a private-box recipient (scheme-prefixed).
pub fn private_addr(scheme: &str, feed: &scuttle_types::FeedRef) -> Addr {
    let mut addr = format!("{scheme}:").into_bytes();
    addr.extend_from_slice(&feed.stored_bytes());
    addr
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_set() -> (tempfile::TempDir, MultilogSet) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path().join("sublogs")).expect("sled open");
        (dir, MultilogSet::new(db))
    }

    #[test]
    fn append_and_read_back_in_order() -> Result<()> {
        let (_dir, set) = temp_set();
        let ml = set.open("userFeeds")?;
        let addr = type_addr("post");

        assert_eq!(ml.append(&addr, 10)?, 0);
        assert_eq!(ml.append(&addr, 12)?, 1);
        assert_eq!(ml.append(&addr, 15)?, 2);

        assert_eq!(ml.read_from(&addr, 0)?, vec![10, 12, 15]);
        assert_eq!(ml.read_from(&addr, 2)?, vec![15]);
        assert_eq!(ml.len(&addr)?, 3);
        Ok(())
    }

    #[test]
    fn sublogs_are_independent() -> Result<()> {
        let (_dir, set) = temp_set();
        let ml = set.open("byType")?;

        ml.append(&type_addr("post"), 1)?;
        ml.append(&type_addr("contact"), 2)?;
        ml.append(&type_addr("post"), 3)?;

        assert_eq!(ml.read_from(&type_addr("post"), 0)?, vec![1, 3]);
        assert_eq!(ml.read_from(&type_addr("contact"), 0)?, vec![2]);
        Ok(())
    }

    #[test]
    fn prefix_addresses_do_not_collide() -> Result<()> {
        // "po" and "post" share a byte prefix; the length prefix in the
        // composite key must keep them apart.
        let (_dir, set) = temp_set();
        let ml = set.open("byType")?;
        ml.append(&type_addr("po"), 1)?;
        ml.append(&type_addr("post"), 2)?;

        assert_eq!(ml.read_from(&type_addr("po"), 0)?, vec![1]);
        assert_eq!(ml.read_from(&type_addr("post"), 0)?, vec![2]);
        Ok(())
    }

    #[test]
    fn addrs_lists_active_sublogs() -> Result<()> {
        let (_dir, set) = temp_set();
        let ml = set.open("tangles")?;
        ml.append(b"root-a", 1)?;
        ml.append(b"root-b", 2)?;

        let mut addrs = ml.addrs()?;
        addrs.sort();
        assert_eq!(addrs, vec![b"root-a".to_vec(), b"root-b".to_vec()]);
        Ok(())
    }

    #[tokio::test]
    async fn wait_for_append_wakes() -> Result<()> {
        let (_dir, set) = temp_set();
        let ml = set.open("userFeeds")?;
        let ml2 = ml.clone();

        let waiter = tokio::spawn(async move {
            ml2.wait_for_append().await;
        });
        // Give the waiter time to register.
        tokio::task::yield_now().await;
        ml.append(b"addr", 1)?;
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .expect("join");
        Ok(())
    }
}
