//! Configuration management for the backup rotator.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BACKUP__<SECTION>__<KEY>`, e.g. `BACKUP__RETENTION__RECENT=3`). The
//! loaded value is immutable and passed explicitly to every component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::errors::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub retention: RetentionConfig,
    pub notify: NotifyConfig,
    pub guard: GuardConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory that receives archives and their digest sidecars
    pub destination: PathBuf,

    /// Comma-separated exclusion globs, e.g. `"*.tmp, cache/*"`
    pub exclude: String,

    /// Minimum free space at the destination before a run may write (MB)
    pub min_free_mb: u64,

    /// Incremental snapshot state (default: `<destination>/.snapshot.json`)
    pub snapshot_file: Option<PathBuf>,

    /// Compression level (1-22 for zstd)
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Newest archives always kept
    pub recent: usize,

    /// One archive per ISO week, this many weeks
    pub weekly: usize,

    /// One archive per calendar month, this many months
    pub monthly: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Recipient address; notifications are disabled when unset
    pub recipient: Option<String>,

    /// Spool directory for outgoing notifications
    pub spool_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Lock file shared by every run on this host
    pub lock_file: PathBuf,

    /// Remove a lock whose recorded PID is no longer alive
    pub break_stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log output (stdout, file)
    pub output: LogOutput,

    /// Log file, used when `output = "file"`
    pub file: PathBuf,
}

// Default values
fn default_destination() -> PathBuf {
    PathBuf::from("/var/backups/backup-rotator")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/tmp/backup-rotator.lock")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/backup-rotator")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/backup-rotator.log")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            exclude: String::new(),
            min_free_mb: 100,
            snapshot_file: None,
            compression_level: 3,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            recent: 7,
            weekly: 4,
            monthly: 3,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            spool_dir: default_spool_dir(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lock_file: default_lock_file(),
            break_stale: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            file: default_log_file(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `BACKUP__*` environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("BACKUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| crate::BackupError::Config(e.to_string()))
    }
}

impl ArchiveConfig {
    /// Exclusion globs: split on commas, trimmed, empty elements dropped
    pub fn exclude_patterns(&self) -> Vec<String> {
        self.exclude
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_file
            .clone()
            .unwrap_or_else(|| self.destination.join(".snapshot.json"))
    }
}
