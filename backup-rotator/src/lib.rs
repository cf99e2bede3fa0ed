//! Backup Rotator Library
//!
//! Backup lifecycle engine: single-instance execution guard, verified
//! `.tar.zst` archive creation, grandfather-father-son rotation and restore.

pub mod archive;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod notify;
pub mod restore;
pub mod retention;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
