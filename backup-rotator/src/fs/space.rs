//! Pre-flight free-space check for the backup destination.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::utils::errors::{BackupError, Result};
use crate::utils::format::format_bytes;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of free-space figures for a path
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// `statvfs(2)` backed probe
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// Asserts a minimum amount of free space at the destination
pub struct SpaceChecker<'a> {
    probe: &'a dyn SpaceProbe,
}

impl<'a> SpaceChecker<'a> {
    pub fn new(probe: &'a dyn SpaceProbe) -> Self {
        Self { probe }
    }

    /// Fail unless at least `min_mb` MB are available at `destination`.
    ///
    /// The destination may not exist yet; its nearest existing ancestor is
    /// queried instead. Exactly `min_mb` available passes.
    pub fn ensure(&self, destination: &Path, min_mb: u64) -> Result<u64> {
        let probe_path = nearest_existing(destination).ok_or_else(|| BackupError::SpaceUnknown {
            path: destination.to_path_buf(),
            reason: "no existing ancestor directory".to_string(),
        })?;

        let available = self
            .probe
            .available_bytes(&probe_path)
            .map_err(|e| BackupError::SpaceUnknown {
                path: probe_path.clone(),
                reason: e.to_string(),
            })?;

        let available_mb = available / BYTES_PER_MB;
        if available_mb < min_mb {
            return Err(BackupError::InsufficientSpace {
                required_mb: min_mb,
                available_mb,
            });
        }

        info!(
            path = %probe_path.display(),
            available = %format_bytes(available),
            required_mb = min_mb,
            "Free space check passed"
        );
        Ok(available_mb)
    }
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .or_else(|| {
            if path.is_relative() {
                Some(PathBuf::from("."))
            } else {
                None
            }
        })
}
