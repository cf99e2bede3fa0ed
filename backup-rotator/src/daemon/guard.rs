//! Single-instance execution guard.
//!
//! A lock file whose existence means "a backup, restore or cleanup run is
//! active on this host". The file is created atomically and removed on every
//! exit path: explicitly via [`ExecutionGuard::release`], on drop, or by the
//! shutdown coordinator when a signal arrives.
//!
//! A token left behind by a crashed host has no expiry. It must be cleared by
//! hand unless `guard.break_stale` is enabled, in which case a token whose
//! recorded PID is no longer alive is removed and acquisition retried once.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::utils::errors::{BackupError, Result};

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    started_at: u64,
}

/// Held execution guard; the lock file lives as long as this value.
#[derive(Debug)]
pub struct ExecutionGuard {
    path: PathBuf,
    released: AtomicBool,
}

impl ExecutionGuard {
    /// Acquire the guard described by `config`.
    ///
    /// Fails with `AlreadyRunning` if the lock file exists. Never creates a
    /// second token.
    pub fn acquire(config: &GuardConfig) -> Result<Self> {
        Self::acquire_at(&config.lock_file, config.break_stale)
    }

    pub fn acquire_at(path: &Path, break_stale: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Self::try_create(path) {
            Ok(guard) => Ok(guard),
            Err(BackupError::AlreadyRunning { pid, .. }) if break_stale => {
                match pid {
                    Some(pid) if !is_process_alive(pid) => {
                        warn!(lock = %path.display(), pid, "Removing stale lock file");
                        match std::fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                        Self::try_create(path)
                    }
                    _ => Err(BackupError::AlreadyRunning {
                        path: path.to_path_buf(),
                        pid,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path) -> Result<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BackupError::AlreadyRunning {
                    path: path.to_path_buf(),
                    pid: read_lock_pid(path),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let guard = Self {
            path: path.to_path_buf(),
            released: AtomicBool::new(false),
        };

        // On a write failure the guard drops here and removes the file.
        let content = LockContent {
            pid: std::process::id(),
            started_at: current_timestamp_ms(),
        };
        let serialized = serde_json::to_string(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;

        info!(lock = %path.display(), pid = content.pid, "Execution guard acquired");
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. Idempotent; never fails.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "Execution guard released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_lock_pid(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<LockContent>(&contents)
        .ok()
        .map(|c| c.pid)
}

/// Check if process is alive (signal 0 probes existence without delivering anything)
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // EPERM: exists but owned by someone else
        Err(_) => true,
    }
}

fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
