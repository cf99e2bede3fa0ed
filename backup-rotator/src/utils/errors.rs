//! Error types for the backup lifecycle engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Another backup run is already active (lock file {path}{})", holder_suffix(.pid))]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("Insufficient disk space: {required_mb} MB required, {available_mb} MB available")]
    InsufficientSpace { required_mb: u64, available_mb: u64 },

    #[error("Unable to determine free space at {path}: {reason}")]
    SpaceUnknown { path: PathBuf, reason: String },

    #[error("Source directory not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Source directory not readable: {path}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("Archive creation failed for {path}: {reason}")]
    ArchiveCreationFailed { path: PathBuf, reason: String },

    #[error("Failed to write checksum file {path}: {reason}")]
    ChecksumWriteFailed { path: PathBuf, reason: String },

    #[error("Checksum verification failed for {path}: {reason}")]
    ChecksumMismatch { path: PathBuf, reason: String },

    #[error("Archive integrity check failed for {path}: {reason}")]
    ArchiveCorrupted { path: PathBuf, reason: String },

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Refusing to restore {path}: checksum does not match ({reason})")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("Extraction of {path} failed: {reason}")]
    ExtractionFailed { path: PathBuf, reason: String },

    #[error("Destination not writable: {path}: {reason}")]
    DestinationUnwritable { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(", held by pid {}", pid),
        None => String::new(),
    }
}

impl BackupError {
    /// Process exit status for this failure.
    ///
    /// `AlreadyRunning` uses EX_TEMPFAIL so schedulers can tell "try later"
    /// apart from a failed backup.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::AlreadyRunning { .. } => 75,
            _ => 1,
        }
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(e: config::ConfigError) -> Self {
        BackupError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
