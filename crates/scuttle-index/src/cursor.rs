//! Persisted index cursors.
//!
//! Each sink records the position it has processed in
//! `indexes/<name>/state.json`. The file is replaced atomically
//! (write-then-rename) so a crash leaves either the old or the new
//! cursor, never a torn one.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use scuttle_types::{Result, ScuttleError};

#[derive(Serialize, Deserialize)]
struct State {
    processed: u64,
}

/// One sink's durable cursor.
pub struct Cursor {
    path: PathBuf,
}

impl Cursor {
    /// Opens the cursor stored in `dir/state.json`.
    pub fn open(dir: PathBuf) -> Self {
        Self {
            path: dir.join("state.json"),
        }
    }

    /// Loads the processed position; zero when no state exists yet.
    pub fn load(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to read cursor {:?}: {e}", self.path),
        })?;
        let state: State = serde_json::from_str(&raw).map_err(|e| ScuttleError::Corrupt {
            index: self.path.display().to_string(),
            reason: format!("malformed cursor file: {e}"),
        })?;
        Ok(state.processed)
    }

    /// Stores the processed position atomically.
    pub fn store(&self, processed: u64) -> Result<()> {
        let json = serde_json::to_string(&State { processed }).map_err(|e| {
            ScuttleError::Storage {
                reason: format!("failed to encode cursor: {e}"),
            }
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to write cursor {tmp:?}: {e}"),
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to replace cursor {:?}: {e}", self.path),
        })?;
        Ok(())
    }
}
