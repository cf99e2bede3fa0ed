//! Registry of partially written artifacts.
//!
//! The archive pipeline registers every file it is about to write and
//! unregisters it once the archive has been verified. Whatever is still
//! registered when the process is interrupted is removed by the shutdown
//! coordinator, so an interrupted run never leaves a half-written archive
//! that a later restore could pick up.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &Path) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_path_buf());
        }
    }

    pub fn unregister(&self, path: &Path) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.retain(|p| p != path);
    }

    pub fn pending(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Remove every registered file that exists. Returns the number removed.
    pub fn remove_all(&self) -> usize {
        let paths: Vec<PathBuf> = {
            let mut guard = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        let mut removed = 0;
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Removed partial artifact");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
            }
        }
        removed
    }
}
