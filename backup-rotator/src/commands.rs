//! Command dispatch.
//!
//! Each command runs synchronously; the binary owns the execution guard and
//! signal handling around it.

use clap::Subcommand;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::archive::codec::TarZstdCodec;
use crate::archive::record::{resolve_archive, scan_destination};
use crate::archive::{ArchivePipeline, BackupMode, BackupOutcome};
use crate::config::Config;
use crate::daemon::CleanupRegistry;
use crate::fs::StatvfsProbe;
use crate::notify::Notifier;
use crate::restore::RestorePipeline;
use crate::retention::{RetentionEngine, RetentionPolicy, RotationReport};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::format_bytes;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Archive SOURCE into the destination, verify it, then rotate old archives
    Create {
        #[arg(short, long, value_enum, default_value_t = BackupMode::Full)]
        mode: BackupMode,

        /// Directory to back up
        source: PathBuf,
    },

    /// Verify and extract an archive into TARGET
    Restore {
        /// Archive path, or archive name in the destination
        archive: String,

        /// Directory to extract into (created if absent)
        target: PathBuf,
    },

    /// List archives in the destination
    List,

    /// Apply the retention policy to the destination
    Rotate {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Check an archive's digest and structure
    Verify {
        /// Archive path, or archive name in the destination
        archive: String,
    },
}

impl Command {
    /// Whether the command must hold the execution guard
    pub fn needs_guard(&self) -> bool {
        !matches!(self, Command::List)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Restore { .. } => "restore",
            Command::List => "list",
            Command::Rotate { .. } => "rotate",
            Command::Verify { .. } => "verify",
        }
    }
}

/// Run one command to completion
pub fn execute(
    command: &Command,
    config: &Config,
    notifier: &dyn Notifier,
    cleanup: CleanupRegistry,
) -> Result<()> {
    let codec = TarZstdCodec::new(config.archive.compression_level);

    match command {
        Command::Create { mode, source } => {
            let probe = StatvfsProbe;
            let mut pipeline = ArchivePipeline::new(config, &codec, &probe, notifier, cleanup);

            match pipeline.create(source, *mode)? {
                BackupOutcome::Created(report) => {
                    println!(
                        "Created {} ({})",
                        report.archive_path.display(),
                        format_bytes(report.size_bytes)
                    );
                    rotate_after_create(config, notifier)?;
                }
                BackupOutcome::DryRun {
                    archive_path,
                    excludes,
                    estimated_bytes,
                } => {
                    println!(
                        "Dry run: would create {} from {} of data",
                        archive_path.display(),
                        format_bytes(estimated_bytes)
                    );
                    if !excludes.is_empty() {
                        println!("Exclusions: {}", excludes.join(", "));
                    }
                }
            }
            Ok(())
        }

        Command::Restore { archive, target } => {
            let pipeline = RestorePipeline::new(config, &codec, notifier);
            let report = pipeline.restore(archive, target)?;
            println!(
                "Restored {} into {}",
                report.archive_path.display(),
                report.target.display()
            );
            Ok(())
        }

        Command::List => list(&config.archive.destination),

        Command::Rotate { dry_run } => {
            let report = rotate(config, *dry_run)?;
            print_rotation(&report);
            Ok(())
        }

        Command::Verify { archive } => {
            let probe = StatvfsProbe;
            let pipeline = ArchivePipeline::new(config, &codec, &probe, notifier, cleanup);

            let path = resolve_archive(&config.archive.destination, archive)
                .ok_or_else(|| BackupError::ArchiveNotFound(archive.clone()))?;

            match pipeline.verify(&path) {
                Ok(report) => {
                    info!(archive = %path.display(), entries = report.entries, "Archive verified");
                    println!(
                        "OK {} ({}, {} entries)",
                        report.archive_path.display(),
                        format_bytes(report.size_bytes),
                        report.entries
                    );
                    Ok(())
                }
                Err(e) => {
                    error!(archive = %path.display(), error = %e, "Verification failed");
                    notifier.notify(
                        "Verification FAILED",
                        &format!("Archive: {}\nError: {}", path.display(), e),
                    );
                    Err(e)
                }
            }
        }
    }
}

fn rotate(config: &Config, dry_run: bool) -> Result<RotationReport> {
    let engine = RetentionEngine::new(RetentionPolicy::from(&config.retention));
    let report = engine.rotate(&config.archive.destination, dry_run)?;

    if !report.failed.is_empty() || !report.sidecar_failures.is_empty() {
        warn!(
            failed = report.failed.len(),
            sidecars_left = report.sidecar_failures.len(),
            "Some archives could not be deleted"
        );
    }

    Ok(report)
}

/// Rotation that follows a successful create. The new archive is already
/// verified, so problems here are reported on their own subject.
fn rotate_after_create(config: &Config, notifier: &dyn Notifier) -> Result<()> {
    let destination = &config.archive.destination;

    let report = match rotate(config, false) {
        Ok(report) => report,
        Err(e) => {
            error!(destination = %destination.display(), error = %e, "Rotation failed");
            notifier.notify(
                "Rotation FAILED",
                &format!("Destination: {}\nError: {}", destination.display(), e),
            );
            return Err(e);
        }
    };

    notify_incomplete(destination, &report, notifier);
    Ok(())
}

fn notify_incomplete(destination: &Path, report: &RotationReport, notifier: &dyn Notifier) {
    if !report.failed.is_empty() || !report.sidecar_failures.is_empty() {
        let mut lines: Vec<String> = report
            .failed
            .iter()
            .map(|(archive, reason)| format!("{}: {}", archive.path.display(), reason))
            .collect();
        lines.extend(
            report
                .sidecar_failures
                .iter()
                .map(|(path, reason)| format!("{}: {}", path.display(), reason)),
        );
        notifier.notify(
            "Rotation incomplete",
            &format!(
                "Destination: {}\nDeleted: {}\nNot deleted:\n{}",
                destination.display(),
                report.deleted.len(),
                lines.join("\n")
            ),
        );
    }
}

fn print_rotation(report: &RotationReport) {
    for (archive, tag) in &report.kept {
        println!("keep    {:<10} {}", tag.to_string(), archive.name);
    }

    let verb = if report.dry_run { "would delete" } else { "deleted" };
    for archive in &report.deleted {
        println!("{:<18} {}", verb, archive.name);
    }
    for (archive, reason) in &report.failed {
        println!("failed  {} ({})", archive.name, reason);
    }
    for (path, reason) in &report.sidecar_failures {
        println!("failed  {} ({})", path.display(), reason);
    }
    for path in &report.unrecognized {
        println!("skipped {} (unrecognized name)", path.display());
    }
}

fn list(destination: &Path) -> Result<()> {
    let scan = scan_destination(destination)?;

    if scan.archives.is_empty() {
        println!("No archives in {}", destination.display());
    }

    for archive in &scan.archives {
        let size = archive
            .size_bytes()
            .map(format_bytes)
            .unwrap_or_else(|| "?".to_string());
        let digest = if archive.digest_path.is_some() { "sha256" } else { "-" };
        println!(
            "{}  {}  {:>10}  {}",
            archive.file_name(),
            archive.created_at.format("%Y-%m-%d %H:%M"),
            size,
            digest
        );
    }

    for path in &scan.unrecognized {
        println!("{}  (unrecognized name)", path.display());
    }

    Ok(())
}
