//! Restore pipeline: locate an archive, verify it, extract it.

use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::archive::codec::ArchiveCodec;
use crate::archive::digest;
use crate::archive::record::{digest_path_for, resolve_archive};
use crate::config::Config;
use crate::notify::Notifier;
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::format_duration;

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub archive_path: PathBuf,
    pub target: PathBuf,
    /// False when no digest sidecar was found
    pub verified: bool,
    pub duration_secs: u64,
}

pub struct RestorePipeline<'a> {
    config: &'a Config,
    codec: &'a dyn ArchiveCodec,
    notifier: &'a dyn Notifier,
}

impl<'a> RestorePipeline<'a> {
    pub fn new(config: &'a Config, codec: &'a dyn ArchiveCodec, notifier: &'a dyn Notifier) -> Self {
        Self {
            config,
            codec,
            notifier,
        }
    }

    /// Resolve `archive_ref` as a path, or as a name in the destination
    pub fn resolve(&self, archive_ref: &str) -> Result<PathBuf> {
        resolve_archive(&self.config.archive.destination, archive_ref)
            .ok_or_else(|| BackupError::ArchiveNotFound(archive_ref.to_string()))
    }

    pub fn restore(&self, archive_ref: &str, target: &Path) -> Result<RestoreReport> {
        info!(archive = archive_ref, target = %target.display(), "Starting restore");

        match self.run(archive_ref, target) {
            Ok(report) => {
                info!(
                    archive = %report.archive_path.display(),
                    target = %report.target.display(),
                    verified = report.verified,
                    duration = %format_duration(report.duration_secs),
                    "Restore completed"
                );
                self.notifier.notify(
                    "Restore succeeded",
                    &format!(
                        "Archive: {}\nTarget: {}\nDigest verified: {}\nDuration: {}",
                        report.archive_path.display(),
                        report.target.display(),
                        if report.verified { "yes" } else { "no (sidecar missing)" },
                        format_duration(report.duration_secs),
                    ),
                );
                Ok(report)
            }
            Err(e) => {
                error!(archive = archive_ref, target = %target.display(), error = %e, "Restore failed");
                self.notifier.notify(
                    "Restore FAILED",
                    &format!(
                        "Archive: {}\nTarget: {}\nError: {}",
                        archive_ref,
                        target.display(),
                        e
                    ),
                );
                Err(e)
            }
        }
    }

    fn run(&self, archive_ref: &str, target: &Path) -> Result<RestoreReport> {
        let started = Instant::now();
        let archive_path = self.resolve(archive_ref)?;

        let sidecar = digest_path_for(&archive_path);
        let verified = if sidecar.exists() {
            let check = digest::verify(&archive_path, &sidecar);
            if !check.is_match() {
                return Err(BackupError::CorruptArchive {
                    path: archive_path,
                    reason: check.describe(),
                });
            }
            info!(archive = %archive_path.display(), "Digest verified");
            true
        } else {
            warn!(
                archive = %archive_path.display(),
                "No digest sidecar, restoring with reduced assurance"
            );
            false
        };

        std::fs::create_dir_all(target).map_err(|e| BackupError::ExtractionFailed {
            path: target.to_path_buf(),
            reason: e.to_string(),
        })?;

        self.codec
            .extract(&archive_path, target)
            .map_err(|e| BackupError::ExtractionFailed {
                path: archive_path.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(RestoreReport {
            archive_path,
            target: target.to_path_buf(),
            verified,
            duration_secs: started.elapsed().as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::codec::{IncrementalState, TarZstdCodec};
    use crate::notify::tests::RecordingNotifier;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        config: Config,
        archive: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("top.txt"), b"top").unwrap();
        fs::write(source.join("nested/deep.txt"), b"deep").unwrap();

        let mut config = Config::default();
        config.archive.destination = temp.path().join("backups");
        fs::create_dir_all(&config.archive.destination).unwrap();

        let archive = config
            .archive
            .destination
            .join("backup-2024-02-01-0300.tar.zst");
        TarZstdCodec::default()
            .create_archive(&archive, &source, &[], IncrementalState::Neutral)
            .unwrap();
        digest::write_sidecar(&archive).unwrap();

        Fixture {
            temp,
            config,
            archive,
        }
    }

    #[test]
    fn test_resolve_by_path_and_name() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let notifier = RecordingNotifier::default();
        let pipeline = RestorePipeline::new(&fx.config, &codec, &notifier);

        let by_path = fx.archive.to_string_lossy().to_string();
        assert_eq!(pipeline.resolve(&by_path).unwrap(), fx.archive);
        assert_eq!(
            pipeline.resolve("backup-2024-02-01-0300.tar.zst").unwrap(),
            fx.archive
        );
        assert_eq!(pipeline.resolve("backup-2024-02-01-0300").unwrap(), fx.archive);
        assert!(matches!(
            pipeline.resolve("backup-1999-01-01-0000"),
            Err(BackupError::ArchiveNotFound(_))
        ));
    }

    #[test]
    fn test_restore_into_new_directory() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let notifier = RecordingNotifier::default();
        let pipeline = RestorePipeline::new(&fx.config, &codec, &notifier);
        let target = fx.temp.path().join("restore/here");

        let report = pipeline.restore("backup-2024-02-01-0300", &target).unwrap();

        assert!(report.verified);
        assert_eq!(fs::read(target.join("top.txt")).unwrap(), b"top");
        assert_eq!(fs::read(target.join("nested/deep.txt")).unwrap(), b"deep");
        assert_eq!(notifier.subjects(), vec!["Restore succeeded"]);
    }

    #[test]
    fn test_corrupt_archive_not_extracted() {
        let fx = fixture();
        let mut bytes = fs::read(&fx.archive).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&fx.archive, bytes).unwrap();

        let codec = TarZstdCodec::default();
        let notifier = RecordingNotifier::default();
        let pipeline = RestorePipeline::new(&fx.config, &codec, &notifier);
        let target = fx.temp.path().join("target");

        let result = pipeline.restore("backup-2024-02-01-0300", &target);

        assert!(matches!(result, Err(BackupError::CorruptArchive { .. })));
        assert!(!target.exists());
        assert_eq!(notifier.subjects(), vec!["Restore FAILED"]);
    }

    #[test]
    fn test_missing_sidecar_restores_unverified() {
        let fx = fixture();
        fs::remove_file(digest_path_for(&fx.archive)).unwrap();

        let codec = TarZstdCodec::default();
        let notifier = RecordingNotifier::default();
        let pipeline = RestorePipeline::new(&fx.config, &codec, &notifier);
        let target = fx.temp.path().join("target");

        let report = pipeline.restore("backup-2024-02-01-0300", &target).unwrap();
        assert!(!report.verified);
        assert!(target.join("top.txt").exists());
    }

    #[test]
    fn test_unreadable_archive_fails_extraction() {
        let fx = fixture();
        let bogus = fx.config.archive.destination.join("backup-2024-03-01-0000.tar.zst");
        fs::write(&bogus, b"garbage").unwrap();

        let codec = TarZstdCodec::default();
        let notifier = RecordingNotifier::default();
        let pipeline = RestorePipeline::new(&fx.config, &codec, &notifier);

        let result = pipeline.restore("backup-2024-03-01-0000", &fx.temp.path().join("t"));
        assert!(matches!(result, Err(BackupError::ExtractionFailed { .. })));
    }

    #[test]
    fn test_unknown_archive() {
        let fx = fixture();
        let codec = TarZstdCodec::default();
        let notifier = RecordingNotifier::default();
        let pipeline = RestorePipeline::new(&fx.config, &codec, &notifier);

        let result = pipeline.restore("nope", &fx.temp.path().join("t"));
        assert!(matches!(result, Err(BackupError::ArchiveNotFound(_))));
    }
}
