//! End-to-end lifecycle: create, rotate, restore and compare.

use backup_rotator::archive::codec::TarZstdCodec;
use backup_rotator::archive::record::{archive_file_name, scan_destination};
use backup_rotator::archive::{ArchivePipeline, BackupMode, BackupOutcome};
use backup_rotator::config::Config;
use backup_rotator::daemon::{CleanupRegistry, ExecutionGuard};
use backup_rotator::fs::StatvfsProbe;
use backup_rotator::notify::NullNotifier;
use backup_rotator::restore::RestorePipeline;
use backup_rotator::retention::{RetentionEngine, RetentionPolicy};
use backup_rotator::BackupError;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

fn at(month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, month, day)
        .unwrap()
        .and_hms_opt(1, 15, 0)
        .unwrap()
}

/// Relative path -> contents for every regular file under `root`
fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

fn config_in(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.archive.destination = temp.path().join("backups");
    config.archive.exclude = "*.tmp, cache".to_string();
    config.archive.min_free_mb = 1;
    config.guard.lock_file = temp.path().join("rotator.lock");
    config.retention.recent = 2;
    config.retention.weekly = 1;
    config.retention.monthly = 1;
    config
}

fn populate(source: &Path) {
    fs::create_dir_all(source.join("projects/alpha")).unwrap();
    fs::create_dir_all(source.join("cache")).unwrap();
    fs::write(source.join("projects/alpha/main.rs"), b"fn main() {}\n").unwrap();
    fs::write(source.join("projects/readme.md"), b"# projects\n").unwrap();
    fs::write(source.join("projects/alpha/build.tmp"), b"scratch").unwrap();
    fs::write(source.join("cache/blob"), vec![1u8; 4096]).unwrap();
    fs::write(source.join("notes.txt"), b"remember the milk").unwrap();
}

#[test]
fn test_create_rotate_restore_round_trip() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    populate(&source);
    let config = config_in(&temp);

    let guard = ExecutionGuard::acquire(&config.guard).unwrap();
    assert!(matches!(
        ExecutionGuard::acquire(&config.guard),
        Err(BackupError::AlreadyRunning { .. })
    ));

    let codec = TarZstdCodec::new(config.archive.compression_level);
    let probe = StatvfsProbe;
    let notifier = NullNotifier;

    // Ten daily runs across a month boundary
    let days = [(1, 25), (1, 26), (1, 27), (1, 28), (1, 29), (1, 30), (1, 31), (2, 1), (2, 2), (2, 3)];
    for (month, day) in days {
        let mut pipeline =
            ArchivePipeline::new(&config, &codec, &probe, &notifier, CleanupRegistry::new())
                .with_clock(move || at(month, day));
        let outcome = pipeline.create(&source, BackupMode::Full).unwrap();
        assert!(matches!(outcome, BackupOutcome::Created(_)));
    }
    assert_eq!(scan_destination(&config.archive.destination).unwrap().archives.len(), 10);

    let engine = RetentionEngine::new(RetentionPolicy::from(&config.retention));
    let report = engine.rotate(&config.archive.destination, false).unwrap();
    let kept: Vec<String> = report.kept.iter().map(|(a, _)| a.name.clone()).collect();
    assert_eq!(
        kept,
        vec![
            "backup-2024-02-03-0115",
            "backup-2024-02-02-0115",
            "backup-2024-02-01-0115",
            "backup-2024-01-31-0115",
        ]
    );
    assert_eq!(report.deleted.len(), 6);

    // Second rotation over the same set changes nothing
    let again = engine.rotate(&config.archive.destination, false).unwrap();
    assert!(again.deleted.is_empty());
    assert_eq!(again.kept.len(), 4);

    let target = temp.path().join("restored");
    let restore = RestorePipeline::new(&config, &codec, &notifier);
    let restored = restore.restore("backup-2024-02-03-0115", &target).unwrap();
    assert!(restored.verified);

    let mut expected = tree(&source);
    expected.retain(|path, _| !path.ends_with(".tmp") && !path.starts_with("cache"));
    assert_eq!(tree(&target), expected);

    drop(guard);
    assert!(!config.guard.lock_file.exists());
}

#[test]
fn test_dry_run_creates_nothing() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    populate(&source);
    let mut config = config_in(&temp);
    config.archive.snapshot_file = Some(temp.path().join("state/snapshot.json"));

    let codec = TarZstdCodec::default();
    let probe = StatvfsProbe;
    let notifier = NullNotifier;

    let mut pipeline =
        ArchivePipeline::new(&config, &codec, &probe, &notifier, CleanupRegistry::new())
            .with_clock(|| at(3, 1));
    match pipeline.create(&source, BackupMode::DryRun).unwrap() {
        BackupOutcome::DryRun { archive_path, .. } => {
            assert_eq!(
                archive_path,
                config.archive.destination.join(archive_file_name(at(3, 1)))
            );
        }
        other => panic!("expected dry run, got {:?}", other),
    }

    assert!(!config.archive.destination.exists());
    assert!(!temp.path().join("state").exists());
}
