//! Incremental snapshot state.
//!
//! A snapshot records every entry of the last incremental run with its size
//! and mtime, allowing the codec to diff against it and store only changed
//! entries (same heuristic as rsync's default quick check).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::fs::FileInfo;

const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot state, serialized as JSON at the configured snapshot path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub files: HashMap<String, SnapshotEntry>,
}

/// Metadata for a single entry in the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub size: u64,
    pub mtime: i64,
}

impl Snapshot {
    pub fn from_files(files: &[FileInfo]) -> Self {
        let files = files
            .iter()
            .filter(|f| !f.is_dir)
            .map(|f| {
                (
                    f.relative_path.to_string_lossy().to_string(),
                    SnapshotEntry {
                        size: f.size,
                        mtime: f.mtime,
                    },
                )
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            files,
        }
    }

    /// Load a snapshot; `Ok(None)` when no state exists yet
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            );
        }
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = Self::temp_path(path);
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Staging file `save` writes before renaming over `path`
    pub fn temp_path(path: &Path) -> PathBuf {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// True if `file` has the same size and mtime as recorded
    pub fn is_unchanged(&self, file: &FileInfo) -> bool {
        if file.is_dir {
            return false;
        }

        let key = file.relative_path.to_string_lossy();
        self.files
            .get(key.as_ref())
            .map(|entry| entry.size == file.size && entry.mtime == file.mtime)
            .unwrap_or(false)
    }

    /// Recorded entries no longer present in `files`
    pub fn deleted_count(&self, files: &[FileInfo]) -> usize {
        let seen: std::collections::HashSet<String> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        self.files.keys().filter(|k| !seen.contains(*k)).count()
    }
}
