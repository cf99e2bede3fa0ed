//! Archive pipeline - creates, checksums and verifies one backup archive.
//!
//! A run moves through `Validating → SpaceChecked → Archiving → Checksumming
//! → Verifying` and ends in `Succeeded` or `Failed`. Once `Archiving` has
//! begun, any failure removes the archive and its digest before the error is
//! returned. An archive is only reported as backed up after its digest has
//! been checked against the bytes on disk and its entries listed, and only
//! then is incremental state advanced.

pub mod codec;
pub mod digest;
pub mod record;
pub mod snapshot;

use chrono::{Local, NaiveDateTime};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::daemon::CleanupRegistry;
use crate::fs::walker::calculate_total_size;
use crate::fs::{ExcludeMatcher, SpaceChecker, SpaceProbe, WalkOptions};
use crate::notify::Notifier;
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_bytes, format_duration};
use codec::{ArchiveCodec, ArchiveStats, ArchiveWrite, IncrementalState};
use record::{archive_file_name, archive_name, digest_path_for};
use snapshot::Snapshot;

/// How `create` builds the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackupMode {
    /// Everything, ignoring incremental state
    Full,
    /// Only entries changed since the last incremental run
    Incremental,
    /// Report what would be done; write nothing
    DryRun,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::Incremental => write!(f, "incremental"),
            BackupMode::DryRun => write!(f, "dry-run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Validating,
    SpaceChecked,
    Archiving,
    Checksumming,
    Verifying,
    Succeeded,
    Failed,
}

/// A created and verified archive
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub name: String,
    pub archive_path: PathBuf,
    pub digest_path: PathBuf,
    pub size_bytes: u64,
    pub mode: BackupMode,
    pub stats: ArchiveStats,
    pub duration_secs: u64,
}

#[derive(Debug, Clone)]
pub enum BackupOutcome {
    Created(ArchiveReport),
    DryRun {
        archive_path: PathBuf,
        excludes: Vec<String>,
        /// Uncompressed bytes that would be archived
        estimated_bytes: u64,
    },
}

/// Result of verifying an existing archive
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub entries: usize,
}

type Clock<'a> = Box<dyn Fn() -> NaiveDateTime + Send + Sync + 'a>;

pub struct ArchivePipeline<'a> {
    config: &'a Config,
    codec: &'a dyn ArchiveCodec,
    space: &'a dyn SpaceProbe,
    notifier: &'a dyn Notifier,
    cleanup: CleanupRegistry,
    clock: Clock<'a>,
    state: PipelineState,
}

impl<'a> ArchivePipeline<'a> {
    pub fn new(
        config: &'a Config,
        codec: &'a dyn ArchiveCodec,
        space: &'a dyn SpaceProbe,
        notifier: &'a dyn Notifier,
        cleanup: CleanupRegistry,
    ) -> Self {
        Self {
            config,
            codec,
            space,
            notifier,
            cleanup,
            clock: Box::new(|| Local::now().naive_local()),
            state: PipelineState::Idle,
        }
    }

    /// Replace the local-time clock used for archive names
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline state");
        self.state = next;
    }

    /// Create a backup of `source`
    pub fn create(&mut self, source: &Path, mode: BackupMode) -> Result<BackupOutcome> {
        let started = Instant::now();
        info!(source = %source.display(), %mode, "Starting backup");

        match self.run(source, mode, started) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.transition(PipelineState::Failed);
                error!(source = %source.display(), %mode, error = %e, "Backup failed");
                self.notifier.notify(
                    "Backup FAILED",
                    &format!(
                        "Source: {}\nMode: {}\nDestination: {}\nError: {}",
                        source.display(),
                        mode,
                        self.config.archive.destination.display(),
                        e
                    ),
                );
                Err(e)
            }
        }
    }

    fn run(&mut self, source: &Path, mode: BackupMode, started: Instant) -> Result<BackupOutcome> {
        self.transition(PipelineState::Validating);
        validate_source(source)?;

        let destination = self.config.archive.destination.clone();
        if mode != BackupMode::DryRun {
            ensure_destination(&destination)?;
        }

        SpaceChecker::new(self.space).ensure(&destination, self.config.archive.min_free_mb)?;
        self.transition(PipelineState::SpaceChecked);

        let created_at = (self.clock)();
        let name = archive_name(created_at);
        let archive_path = destination.join(archive_file_name(created_at));
        let excludes = self.config.archive.exclude_patterns();

        if mode == BackupMode::DryRun {
            return self.dry_run(source, archive_path, excludes);
        }

        if archive_path.exists() {
            warn!(archive = %archive_path.display(), "Archive from the same minute exists, overwriting");
        }

        let digest_path = digest_path_for(&archive_path);
        self.cleanup.register(&archive_path);
        self.cleanup.register(&digest_path);

        let result = self.write_and_verify(source, mode, &archive_path, &excludes);

        self.cleanup.unregister(&archive_path);
        self.cleanup.unregister(&digest_path);

        let (written, verified) = match result {
            Ok(done) => done,
            Err(e) => {
                remove_artifacts(&archive_path, &digest_path);
                return Err(e);
            }
        };

        if let Some(snapshot) = &written.snapshot {
            self.commit_snapshot(snapshot);
        }
        let stats = written.stats;

        self.transition(PipelineState::Succeeded);
        let report = ArchiveReport {
            name,
            archive_path,
            digest_path,
            size_bytes: verified.size_bytes,
            mode,
            stats,
            duration_secs: started.elapsed().as_secs(),
        };

        info!(
            archive = %report.archive_path.display(),
            size = %format_bytes(report.size_bytes),
            entries = report.stats.entries,
            unchanged = report.stats.unchanged,
            duration = %format_duration(report.duration_secs),
            "Backup completed and verified"
        );
        self.notifier.notify(
            "Backup succeeded",
            &format!(
                "Archive: {}\nMode: {}\nSize: {} ({} bytes)\nEntries: {}\nUnchanged since last snapshot: {}\nDuration: {}",
                report.archive_path.display(),
                report.mode,
                format_bytes(report.size_bytes),
                report.size_bytes,
                report.stats.entries,
                report.stats.unchanged,
                format_duration(report.duration_secs),
            ),
        );

        Ok(BackupOutcome::Created(report))
    }

    fn dry_run(&self, source: &Path, archive_path: PathBuf, excludes: Vec<String>) -> Result<BackupOutcome> {
        let options = WalkOptions {
            follow_links: false,
            exclude: ExcludeMatcher::new(&excludes)
                .map_err(|e| BackupError::Config(format!("invalid exclusion pattern: {}", e)))?,
        };
        let estimated_bytes =
            calculate_total_size(source, &options).map_err(|e| BackupError::SourceUnreadable {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })?;

        info!(
            source = %source.display(),
            archive = %archive_path.display(),
            excludes = ?excludes,
            estimated = %format_bytes(estimated_bytes),
            "Dry run: would create archive"
        );
        self.notifier.notify(
            "Backup dry run",
            &format!(
                "Source: {}\nWould create: {}\nExclusions: {}\nData to archive: {} (before compression)",
                source.display(),
                archive_path.display(),
                if excludes.is_empty() {
                    "(none)".to_string()
                } else {
                    excludes.join(", ")
                },
                format_bytes(estimated_bytes),
            ),
        );

        Ok(BackupOutcome::DryRun {
            archive_path,
            excludes,
            estimated_bytes,
        })
    }

    fn write_and_verify(
        &mut self,
        source: &Path,
        mode: BackupMode,
        archive_path: &Path,
        excludes: &[String],
    ) -> Result<(ArchiveWrite, VerifyReport)> {
        self.transition(PipelineState::Archiving);

        let snapshot_path = self.config.archive.snapshot_path();
        let state = match mode {
            BackupMode::Incremental => IncrementalState::Snapshot(&snapshot_path),
            _ => IncrementalState::Neutral,
        };

        let written = self
            .codec
            .create_archive(archive_path, source, excludes, state)
            .map_err(|e| BackupError::ArchiveCreationFailed {
                path: archive_path.to_path_buf(),
                reason: format!("{:#}", e),
            })?;

        self.transition(PipelineState::Checksumming);
        digest::write_sidecar(archive_path).map_err(|e| BackupError::ChecksumWriteFailed {
            path: digest_path_for(archive_path),
            reason: e.to_string(),
        })?;

        self.transition(PipelineState::Verifying);
        let verified = self.verify(archive_path)?;

        Ok((written, verified))
    }

    /// Save incremental state for the next run. Only called once the archive
    /// holding the changes has verified.
    ///
    /// A failure keeps the previous state, so the next incremental run stores
    /// a superset of the changes; the verified archive stands.
    fn commit_snapshot(&self, snapshot: &Snapshot) {
        let path = self.config.archive.snapshot_path();
        let staging = Snapshot::temp_path(&path);

        self.cleanup.register(&staging);
        let result = snapshot.save(&path);
        self.cleanup.unregister(&staging);

        match result {
            Ok(()) => debug!(snapshot = %path.display(), entries = snapshot.files.len(), "Snapshot state updated"),
            Err(e) => {
                let _ = std::fs::remove_file(&staging);
                warn!(snapshot = %path.display(), error = %format!("{:#}", e), "Failed to update snapshot state, keeping previous");
            }
        }
    }

    /// Check an archive against its digest sidecar, then list its entries.
    ///
    /// A missing or unreadable sidecar counts as a mismatch.
    pub fn verify(&self, archive_path: &Path) -> Result<VerifyReport> {
        let sidecar = digest_path_for(archive_path);
        let check = digest::verify(archive_path, &sidecar);
        if !check.is_match() {
            return Err(BackupError::ChecksumMismatch {
                path: archive_path.to_path_buf(),
                reason: check.describe(),
            });
        }

        let entries = self
            .codec
            .list_entries(archive_path)
            .map_err(|e| BackupError::ArchiveCorrupted {
                path: archive_path.to_path_buf(),
                reason: format!("{:#}", e),
            })?;

        let size_bytes = std::fs::metadata(archive_path)?.len();
        debug!(archive = %archive_path.display(), entries = entries.len(), "Archive verified");

        Ok(VerifyReport {
            archive_path: archive_path.to_path_buf(),
            size_bytes,
            entries: entries.len(),
        })
    }
}

fn validate_source(source: &Path) -> Result<()> {
    let metadata = match std::fs::metadata(source) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::SourceNotFound(source.to_path_buf()));
        }
        Err(e) => {
            return Err(BackupError::SourceUnreadable {
                path: source.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    if !metadata.is_dir() {
        return Err(BackupError::SourceUnreadable {
            path: source.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    std::fs::read_dir(source).map_err(|e| BackupError::SourceUnreadable {
        path: source.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(())
}

fn ensure_destination(destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination).map_err(|e| BackupError::DestinationUnwritable {
        path: destination.to_path_buf(),
        reason: e.to_string(),
    })
}

fn remove_artifacts(archive_path: &Path, digest_path: &Path) {
    for path in [archive_path, digest_path] {
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "Removed artifact of failed run"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact of failed run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::codec::TarZstdCodec;
    use super::*;
    use crate::fs::space::tests::FixedProbe;
    use crate::notify::tests::RecordingNotifier;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    const PLENTY: Option<u64> = Some(10 * 1024 * 1024 * 1024);

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        config: Config,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data");
        fs::create_dir_all(source.join("logs")).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::write(source.join("logs/app.log"), b"noise").unwrap();

        let mut config = Config::default();
        config.archive.destination = temp.path().join("backups");
        config.archive.exclude = "*.log".to_string();
        config.archive.min_free_mb = 1;

        Fixture {
            _temp: temp,
            source,
            config,
        }
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 30, 0)
            .unwrap()
    }

    /// Writes a partial file and then fails
    struct FailingCodec;

    impl ArchiveCodec for FailingCodec {
        fn create_archive(
            &self,
            output: &Path,
            _source: &Path,
            _excludes: &[String],
            _state: IncrementalState<'_>,
        ) -> anyhow::Result<ArchiveWrite> {
            fs::write(output, b"partial")?;
            anyhow::bail!("disk went away")
        }

        fn list_entries(&self, _archive: &Path) -> anyhow::Result<Vec<PathBuf>> {
            unreachable!()
        }

        fn extract(&self, _archive: &Path, _target: &Path) -> anyhow::Result<()> {
            unreachable!()
        }
    }

    /// Reports success but writes bytes no decoder accepts
    struct GarbageCodec;

    impl ArchiveCodec for GarbageCodec {
        fn create_archive(
            &self,
            output: &Path,
            _source: &Path,
            _excludes: &[String],
            _state: IncrementalState<'_>,
        ) -> anyhow::Result<ArchiveWrite> {
            fs::write(output, b"this is not a zstd frame")?;
            Ok(ArchiveWrite::default())
        }

        fn list_entries(&self, archive: &Path) -> anyhow::Result<Vec<PathBuf>> {
            TarZstdCodec::default().list_entries(archive)
        }

        fn extract(&self, _archive: &Path, _target: &Path) -> anyhow::Result<()> {
            unreachable!()
        }
    }

    fn dest_entries(config: &Config) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(&config.archive.destination) {
            Ok(rd) => rd
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    #[test]
    fn test_full_backup_succeeds_and_verifies() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();
        let cleanup = CleanupRegistry::new();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, cleanup.clone())
                .with_clock(|| at(1, 2));

        let outcome = pipeline.create(&fx.source, BackupMode::Full).unwrap();
        let BackupOutcome::Created(report) = outcome else {
            panic!("expected an archive");
        };

        assert_eq!(report.name, "backup-2024-05-01-0230");
        assert_eq!(pipeline.state(), PipelineState::Succeeded);
        assert!(digest::verify(&report.archive_path, &report.digest_path).is_match());
        assert_eq!(report.size_bytes, fs::metadata(&report.archive_path).unwrap().len());
        assert!(cleanup.pending().is_empty());
        assert_eq!(notifier.subjects(), vec!["Backup succeeded"]);

        let entries = codec.list_entries(&report.archive_path).unwrap();
        assert!(entries.iter().all(|p| !p.to_string_lossy().ends_with(".log")));
        assert!(!fx.config.archive.snapshot_path().exists());
    }

    #[test]
    fn test_success_notification_includes_size() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(1, 3));
        let BackupOutcome::Created(report) = pipeline.create(&fx.source, BackupMode::Full).unwrap()
        else {
            panic!("expected an archive");
        };

        let sent = notifier.sent.lock().unwrap();
        assert!(sent[0].1.contains(&format!("({} bytes)", report.size_bytes)));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(2, 4));

        match pipeline.create(&fx.source, BackupMode::DryRun).unwrap() {
            BackupOutcome::DryRun {
                archive_path,
                excludes,
                estimated_bytes,
            } => {
                assert!(archive_path.ends_with("backup-2024-05-02-0430.tar.zst"));
                assert_eq!(excludes, vec!["*.log"]);
                // a.txt only; logs/app.log is excluded
                assert_eq!(estimated_bytes, 5);
            }
            other => panic!("expected dry run, got {:?}", other),
        }

        assert!(!fx.config.archive.destination.exists());
        assert!(!fx.config.archive.snapshot_path().exists());
        assert_eq!(notifier.subjects(), vec!["Backup dry run"]);
    }

    #[test]
    fn test_dry_run_leaves_existing_destination_untouched() {
        let fx = fixture();
        fs::create_dir_all(&fx.config.archive.destination).unwrap();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        pipeline.create(&fx.source, BackupMode::DryRun).unwrap();

        assert!(dest_entries(&fx.config).is_empty());
    }

    #[test]
    fn test_failed_incremental_run_keeps_snapshot() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();
        let snapshot = fx.config.archive.snapshot_path();

        let mut first =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(6, 1));
        first.create(&fx.source, BackupMode::Incremental).unwrap();
        let state_before = fs::read(&snapshot).unwrap();

        fs::write(fx.source.join("a.txt"), b"alpha, second draft").unwrap();

        // The second run fails after the archive stream was written
        let blocked = fx
            .config
            .archive
            .destination
            .join("backup-2024-05-06-0230.tar.zst");
        fs::create_dir_all(digest_path_for(&blocked)).unwrap();

        let cleanup = CleanupRegistry::new();
        let mut second =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, cleanup.clone())
                .with_clock(|| at(6, 2));
        assert!(matches!(
            second.create(&fx.source, BackupMode::Incremental),
            Err(BackupError::ChecksumWriteFailed { .. })
        ));
        assert!(!blocked.exists());
        assert_eq!(fs::read(&snapshot).unwrap(), state_before);
        assert!(!Snapshot::temp_path(&snapshot).exists());
        assert!(cleanup.pending().is_empty());

        let mut third =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(6, 3));
        let BackupOutcome::Created(report) =
            third.create(&fx.source, BackupMode::Incremental).unwrap()
        else {
            panic!("expected an archive");
        };

        let entries: Vec<String> = codec
            .list_entries(&report.archive_path)
            .unwrap()
            .iter()
            .map(|p| p.to_string_lossy().trim_end_matches('/').to_string())
            .collect();
        assert!(entries.contains(&"a.txt".to_string()));
        assert_ne!(fs::read(&snapshot).unwrap(), state_before);
    }

    #[test]
    fn test_snapshot_save_failure_keeps_verified_archive() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();
        let snapshot = fx.config.archive.snapshot_path();

        // Staging path occupied by a directory, so the state write fails
        fs::create_dir_all(Snapshot::temp_path(&snapshot)).unwrap();

        let cleanup = CleanupRegistry::new();
        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, cleanup.clone())
                .with_clock(|| at(7, 1));
        let BackupOutcome::Created(report) =
            pipeline.create(&fx.source, BackupMode::Incremental).unwrap()
        else {
            panic!("expected an archive");
        };

        assert!(report.archive_path.exists());
        assert!(report.digest_path.exists());
        assert!(!snapshot.exists());
        assert!(cleanup.pending().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Succeeded);
    }

    #[test]
    fn test_dry_run_rejects_invalid_pattern() {
        let mut fx = fixture();
        fx.config.archive.exclude = "[oops".to_string();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        let result = pipeline.create(&fx.source, BackupMode::DryRun);

        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_missing_source() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        let result = pipeline.create(&fx.source.join("nope"), BackupMode::Full);

        assert!(matches!(result, Err(BackupError::SourceNotFound(_))));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(notifier.subjects(), vec!["Backup FAILED"]);
    }

    #[test]
    fn test_source_must_be_directory() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        let result = pipeline.create(&fx.source.join("a.txt"), BackupMode::Full);

        assert!(matches!(result, Err(BackupError::SourceUnreadable { .. })));
    }

    #[test]
    fn test_insufficient_space_writes_nothing() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(Some(0));
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        let result = pipeline.create(&fx.source, BackupMode::Full);

        assert!(matches!(result, Err(BackupError::InsufficientSpace { .. })));
        assert!(dest_entries(&fx.config).is_empty());
    }

    #[test]
    fn test_unwritable_destination() {
        let mut fx = fixture();
        let blocker = fx.source.join("a.txt");
        fx.config.archive.destination = blocker.join("backups");
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        let result = pipeline.create(&fx.source, BackupMode::Full);

        assert!(matches!(result, Err(BackupError::DestinationUnwritable { .. })));
    }

    #[test]
    fn test_codec_failure_removes_partial_archive() {
        let fx = fixture();
        let codec = FailingCodec;
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();
        let cleanup = CleanupRegistry::new();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, cleanup.clone());
        let result = pipeline.create(&fx.source, BackupMode::Full);

        match result {
            Err(BackupError::ArchiveCreationFailed { reason, .. }) => {
                assert!(reason.contains("disk went away"));
            }
            other => panic!("expected ArchiveCreationFailed, got {:?}", other),
        }
        assert!(dest_entries(&fx.config).is_empty());
        assert!(cleanup.pending().is_empty());
    }

    #[test]
    fn test_checksum_write_failure_removes_archive() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        // A directory where the sidecar should go makes the rename fail
        let archive = fx
            .config
            .archive
            .destination
            .join("backup-2024-05-03-0130.tar.zst");
        fs::create_dir_all(digest_path_for(&archive)).unwrap();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(3, 1));
        let result = pipeline.create(&fx.source, BackupMode::Full);

        assert!(matches!(result, Err(BackupError::ChecksumWriteFailed { .. })));
        assert!(!archive.exists());
    }

    #[test]
    fn test_structural_failure_is_fatal_and_cleaned_up() {
        let fx = fixture();
        let codec = GarbageCodec;
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new());
        let result = pipeline.create(&fx.source, BackupMode::Full);

        assert!(matches!(result, Err(BackupError::ArchiveCorrupted { .. })));
        assert!(dest_entries(&fx.config).is_empty());
        assert_eq!(notifier.subjects(), vec!["Backup FAILED"]);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();

        let mut pipeline =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(4, 5));
        let BackupOutcome::Created(report) = pipeline.create(&fx.source, BackupMode::Full).unwrap()
        else {
            panic!("expected an archive");
        };

        assert!(pipeline.verify(&report.archive_path).is_ok());

        let mut bytes = fs::read(&report.archive_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&report.archive_path, bytes).unwrap();

        assert!(matches!(
            pipeline.verify(&report.archive_path),
            Err(BackupError::ChecksumMismatch { .. })
        ));

        fs::remove_file(&report.digest_path).unwrap();
        assert!(matches!(
            pipeline.verify(&report.archive_path),
            Err(BackupError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_incremental_uses_and_updates_snapshot() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let probe = FixedProbe(PLENTY);
        let notifier = RecordingNotifier::default();
        let snapshot = fx.config.archive.snapshot_path();

        let mut first =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(5, 1));
        let BackupOutcome::Created(first_report) =
            first.create(&fx.source, BackupMode::Incremental).unwrap()
        else {
            panic!("expected an archive");
        };
        assert!(!first_report.stats.incremental);
        assert!(snapshot.exists());

        fs::write(fx.source.join("b.txt"), b"new file").unwrap();

        let mut second =
            ArchivePipeline::new(&fx.config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(|| at(5, 2));
        let BackupOutcome::Created(second_report) =
            second.create(&fx.source, BackupMode::Incremental).unwrap()
        else {
            panic!("expected an archive");
        };

        assert!(second_report.stats.incremental);
        let entries: Vec<String> = codec
            .list_entries(&second_report.archive_path)
            .unwrap()
            .iter()
            .map(|p| p.to_string_lossy().trim_end_matches('/').to_string())
            .collect();
        assert!(entries.contains(&"b.txt".to_string()));
        assert!(!entries.contains(&"a.txt".to_string()));
    }
}
