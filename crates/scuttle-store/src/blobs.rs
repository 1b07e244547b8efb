//! Content-addressed blob store.
//!
//! Blobs are stored at `blobs/sha256/<hh>/<rest>` (hex digest split
//! after two characters). Writes stream into `blobs/tmp/` while hashing
//! and are renamed into place once the digest is known, so a visible
//! blob path always holds bytes matching its reference. Puts and
//! deletes are broadcast to subscribers (the want manager).

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use scuttle_crypto::hash::Sha256Stream;
use scuttle_types::{BlobRef, Result, ScuttleError};

/// Buffered notifications per subscriber.
const BROADCAST_CAPACITY: usize = 256;

/// Copy buffer size for streaming puts.
const CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// What happened to a blob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlobOp {
    /// The blob became available locally.
    Put,
    /// The blob was removed by administrative action.
    Rm,
}

/// A change notification from the blob store.
#[derive(Clone, Copy, Debug)]
pub struct BlobNotification {
    /// The operation performed.
    pub op: BlobOp,
    /// The affected blob.
    pub blob: BlobRef,
}

// ---------------------------------------------------------------------------
// BlobStore
// ---------------------------------------------------------------------------

/// Filesystem-backed content-addressed blob storage.
pub struct BlobStore {
    base: PathBuf,
    changes: broadcast::Sender<BlobNotification>,
    tmp_counter: AtomicU64,
}

impl BlobStore {
    /// Opens (or creates) the blob store rooted at `base`.
    pub fn open(base: PathBuf) -> Result<Self> {
        for dir in [base.join("sha256"), base.join("tmp")] {
            fs::create_dir_all(&dir).map_err(|e| ScuttleError::Storage {
                reason: format!("failed to create blob dir {dir:?}: {e}"),
            })?;
        }
        let (changes, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            base,
            changes,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Subscribes to put/delete notifications.
    pub fn changes(&self) -> broadcast::Receiver<BlobNotification> {
        self.changes.subscribe()
    }

    /// Streams `reader` into the store, returning the resulting ref.
    ///
    /// The content is hashed while it is written to a temp file; the
    /// file is renamed into its content-addressed location afterwards.
    pub fn put(&self, reader: &mut dyn Read) -> Result<BlobRef> {
        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to create temp blob {tmp:?}: {e}"),
        })?;

        let mut hasher = Sha256Stream::new();
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = reader.read(&mut buf).map_err(|e| ScuttleError::Storage {
                reason: format!("blob read failed: {e}"),
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).map_err(|e| ScuttleError::Storage {
                reason: format!("blob write failed: {e}"),
            })?;
        }
        file.sync_all().map_err(|e| ScuttleError::Storage {
            reason: format!("blob sync failed: {e}"),
        })?;
        drop(file);

        let blob = BlobRef::new(hasher.finalize());
        let final_path = self.blob_path(&blob);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ScuttleError::Storage {
                reason: format!("failed to create blob shard dir: {e}"),
            })?;
        }
        fs::rename(&tmp, &final_path).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to move blob into place: {e}"),
        })?;

        let _ = self.changes.send(BlobNotification { op: BlobOp::Put, blob });
        tracing::debug!(blob = %blob, "blob stored");
        Ok(blob)
    }

    /// Convenience put from an in-memory slice.
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<BlobRef> {
        let mut cursor = bytes;
        self.put(&mut cursor)
    }

    /// Reads a blob's full contents.
    pub fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        fs::read(self.blob_path(blob)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScuttleError::NotFound {
                    what: format!("blob {blob}"),
                }
            } else {
                ScuttleError::Storage {
                    reason: format!("blob read failed: {e}"),
                }
            }
        })
    }

    /// True if the blob exists locally.
    pub fn has(&self, blob: &BlobRef) -> bool {
        self.blob_path(blob).exists()
    }

    /// Size of a stored blob in bytes.
    pub fn size(&self, blob: &BlobRef) -> Result<u64> {
        let meta = fs::metadata(self.blob_path(blob)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScuttleError::NotFound {
                    what: format!("blob {blob}"),
                }
            } else {
                ScuttleError::Storage {
                    reason: format!("blob stat failed: {e}"),
                }
            }
        })?;
        Ok(meta.len())
    }

    /// Removes a blob and notifies subscribers.
    pub fn delete(&self, blob: &BlobRef) -> Result<()> {
        fs::remove_file(self.blob_path(blob)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScuttleError::NotFound {
                    what: format!("blob {blob}"),
                }
            } else {
                ScuttleError::Storage {
                    reason: format!("blob delete failed: {e}"),
                }
            }
        })?;
        let _ = self.changes.send(BlobNotification {
            op: BlobOp::Rm,
            blob: *blob,
        });
        Ok(())
    }

    /// Lists every stored blob by walking the shard directories.
    pub fn list(&self) -> Result<Vec<BlobRef>> {
        let mut out = Vec::new();
        let root = self.base.join("sha256");
        let shards = fs::read_dir(&root).map_err(|e| ScuttleError::Storage {
            reason: format!("blob list failed: {e}"),
        })?;
        for shard in shards {
            let shard = shard.map_err(|e| ScuttleError::Storage {
                reason: format!("blob list failed: {e}"),
            })?;
            let prefix = shard.file_name().to_string_lossy().into_owned();
            let files = fs::read_dir(shard.path()).map_err(|e| ScuttleError::Storage {
                reason: format!("blob list failed: {e}"),
            })?;
            for file in files {
                let file = file.map_err(|e| ScuttleError::Storage {
                    reason: format!("blob list failed: {e}"),
                })?;
                let rest = file.file_name().to_string_lossy().into_owned();
                let full = format!("{prefix}{rest}");
                if let Ok(bytes) = hex::decode(&full) {
                    if bytes.len() == 32 {
                        let mut hash = [0u8; 32];
                        hash.copy_from_slice(&bytes);
                        out.push(BlobRef::new(hash));
                    }
                }
            }
        }
        Ok(out)
    }

    fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        let hex = hex::encode(blob.hash());
        self.base.join("sha256").join(&hex[..2]).join(&hex[2..])
    }

    fn tmp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.base.join("tmp").join(format!("{nanos}-{n}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
