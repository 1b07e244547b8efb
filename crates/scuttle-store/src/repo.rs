//! Repository path layout.
//!
//! Everything a node persists lives under one root directory:
//!
//! ```text
//! <root>/
//!   secret              local key pair
//!   log/                receive-log sled database
//!   sublogs/db/         multilog sled database
//!   indexes/db/         sink-index sled database
//!   indexes/<name>/state.json   per-sink cursors
//!   blobs/sha256/<hh>/<rest>    blob contents
//!   socket              local RPC endpoint
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use scuttle_types::{Result, ScuttleError};

/// Resolves and creates the on-disk layout for one repository root.
#[derive(Clone, Debug)]
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    /// Opens a repository at `root`, creating the directory skeleton.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [
            root.to_path_buf(),
            root.join("log"),
            root.join("sublogs"),
            root.join("indexes"),
            root.join("blobs"),
        ] {
            fs::create_dir_all(&dir).map_err(|e| ScuttleError::Storage {
                reason: format!("failed to create {dir:?}: {e}"),
            })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the `secret` key-pair file.
    pub fn secret_path(&self) -> PathBuf {
        self.root.join("secret")
    }

    /// Path of the local RPC socket.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("socket")
    }

    /// Directory of the receive-log database.
    pub fn log_path(&self) -> PathBuf {
        self.root.join("log")
    }

    /// Directory of the multilog database.
    pub fn sublogs_path(&self) -> PathBuf {
        self.root.join("sublogs").join("db")
    }

    /// Directory of the sink-index database.
    pub fn indexes_db_path(&self) -> PathBuf {
        self.root.join("indexes").join("db")
    }

    /// Directory holding one sink's cursor and ancillary state.
    pub fn index_path(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join("indexes").join(name);
        fs::create_dir_all(&dir).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to create index dir {dir:?}: {e}"),
        })?;
        Ok(dir)
    }

    /// Root directory of the blob store.
    pub fn blobs_path(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Drops a sink index's on-disk state so the runner rebuilds it from
    /// the receive log on next start.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let dir = self.root.join("indexes").join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| ScuttleError::Storage {
                reason: format!("failed to drop index {name:?}: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Opens a sled database, mapping open failures to [`ScuttleError::Fatal`]
/// (a store that refuses to open cannot be worked around).
pub fn open_sled(path: &Path) -> Result<sled::Db> {
    sled::open(path).map_err(|e| ScuttleError::Fatal {
        reason: format!("failed to open database at {path:?}: {e}"),
    })
}
