//! File hash memo
//!
//! Hashing large artifacts is the slowest part of `add` and `status`, so
//! the last known hash of each file is remembered together with its size
//! and modification time. A file is rehashed only when either changes.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use dvx_core::hash::hash_file;
use dvx_core::{ContentHash, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Remembered stat and hash of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StateEntry {
    mtime_ns: u128,
    size: u64,
    hash: ContentHash,
}

/// Thread-safe map of file path to last known hash
pub struct HashState {
    entries: DashMap<PathBuf, StateEntry>,
    path: PathBuf,
}

impl HashState {
    /// Load the memo persisted at `path` (empty when absent or unreadable)
    pub fn load(path: &Path) -> Self {
        let entries = DashMap::new();
        if let Ok(data) = std::fs::read(path) {
            match serde_json::from_slice::<Vec<(PathBuf, StateEntry)>>(&data) {
                Ok(saved) => {
                    for (file, entry) in saved {
                        entries.insert(file, entry);
                    }
                }
                Err(e) => debug!(error = %e, "Ignoring unreadable hash state"),
            }
        }
        Self {
            entries,
            path: path.to_path_buf(),
        }
    }

    /// Hash a file, reusing the memo when its size and mtime are unchanged
    pub fn hash_file_cached(&self, file: &Path) -> Result<ContentHash> {
        let metadata = std::fs::metadata(file)?;
        let mtime_ns = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let size = metadata.len();

        if let Some(entry) = self.entries.get(file) {
            if entry.mtime_ns == mtime_ns && entry.size == size {
                return Ok(entry.hash.clone());
            }
        }

        let hash = hash_file(file)?;
        self.entries.insert(
            file.to_path_buf(),
            StateEntry {
                mtime_ns,
                size,
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }

    /// Forget a file, e.g. after it was rewritten by checkout
    pub fn invalidate(&self, file: &Path) {
        self.entries.remove(file);
    }

    /// Number of remembered files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the memo, dropping entries for files that no longer exist
    pub fn save(&self) -> Result<()> {
        let mut saved: Vec<(PathBuf, StateEntry)> = self
            .entries
            .iter()
            .filter(|e| e.key().exists())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        saved.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_vec(&saved)?)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvx_core::hash_bytes;

    #[test]
    fn test_memo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let state_path = dir.path().join("tmp/state.json");

        let state = HashState::load(&state_path);
        assert!(state.is_empty());
        let hash = state.hash_file_cached(&file).unwrap();
        assert_eq!(hash, hash_bytes(b"a,b\n1,2\n"));
        state.save().unwrap();

        let reloaded = HashState::load(&state_path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.hash_file_cached(&file).unwrap(), hash);
    }

    #[test]
    fn test_changed_size_forces_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"one").unwrap();

        let state = HashState::load(&dir.path().join("state.json"));
        state.hash_file_cached(&file).unwrap();
        std::fs::write(&file, b"three").unwrap();
        assert_eq!(state.hash_file_cached(&file).unwrap(), hash_bytes(b"three"));
    }
}
