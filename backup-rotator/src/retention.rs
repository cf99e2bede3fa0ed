//! Grandfather-father-son retention.
//!
//! Archives are ordered newest first and tagged in three passes: the newest
//! `recent` archives, then the newest archive of each of the latest `weekly`
//! ISO weeks, then the newest archive of each of the latest `monthly`
//! calendar months. A tagged archive is never re-tagged and never consumes
//! a week or month key in a later pass. Everything left untagged is deleted
//! together with its digest sidecar.

use chrono::{Datelike, NaiveDateTime};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::archive::record::{scan_destination, ArchiveRecord, DestinationScan};
use crate::config::RetentionConfig;
use crate::utils::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionTag {
    Recent,
    Weekly,
    Monthly,
    Unretained,
}

impl fmt::Display for RetentionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionTag::Recent => write!(f, "recent"),
            RetentionTag::Weekly => write!(f, "weekly"),
            RetentionTag::Monthly => write!(f, "monthly"),
            RetentionTag::Unretained => write!(f, "unretained"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub recent: usize,
    pub weekly: usize,
    pub monthly: usize,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            recent: config.recent,
            weekly: config.weekly,
            monthly: config.monthly,
        }
    }
}

/// Newest first; ties broken by name, descending
fn newest_first(archives: &[ArchiveRecord]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..archives.len()).collect();
    order.sort_by(|&a, &b| {
        archives[b]
            .created_at
            .cmp(&archives[a].created_at)
            .then_with(|| archives[b].name.cmp(&archives[a].name))
    });
    order
}

fn iso_week(at: &NaiveDateTime) -> (i32, u32) {
    let week = at.iso_week();
    (week.year(), week.week())
}

fn month(at: &NaiveDateTime) -> (i32, u32) {
    (at.year(), at.month())
}

fn tag_periodic<K: Eq + Hash>(
    archives: &[ArchiveRecord],
    order: &[usize],
    tags: &mut [RetentionTag],
    tag: RetentionTag,
    limit: usize,
    key: impl Fn(&NaiveDateTime) -> K,
) {
    let mut consumed = HashSet::new();
    for &idx in order {
        if consumed.len() >= limit {
            break;
        }
        if tags[idx] != RetentionTag::Unretained {
            continue;
        }
        if consumed.insert(key(&archives[idx].created_at)) {
            tags[idx] = tag;
        }
    }
}

/// Tag every archive. The returned tags are index-aligned with `archives`.
pub fn classify(archives: &[ArchiveRecord], policy: &RetentionPolicy) -> Vec<RetentionTag> {
    let order = newest_first(archives);
    let mut tags = vec![RetentionTag::Unretained; archives.len()];

    for &idx in order.iter().take(policy.recent) {
        tags[idx] = RetentionTag::Recent;
    }
    tag_periodic(archives, &order, &mut tags, RetentionTag::Weekly, policy.weekly, iso_week);
    tag_periodic(archives, &order, &mut tags, RetentionTag::Monthly, policy.monthly, month);

    tags
}

/// What a rotation run kept, deleted and skipped
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    /// Kept archives with their tier, newest first
    pub kept: Vec<(ArchiveRecord, RetentionTag)>,
    /// Deleted archives (or, in a dry run, archives that would be deleted)
    pub deleted: Vec<ArchiveRecord>,
    /// Archives whose deletion failed, with the reason
    pub failed: Vec<(ArchiveRecord, String)>,
    /// Digest sidecars left behind after their archive was deleted
    pub sidecar_failures: Vec<(PathBuf, String)>,
    /// `.tar.zst` files with names that do not parse; never deleted
    pub unrecognized: Vec<PathBuf>,
    pub dry_run: bool,
}

pub struct RetentionEngine {
    policy: RetentionPolicy,
}

impl RetentionEngine {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Scan `destination` once and apply the policy to what was found
    pub fn rotate(&self, destination: &Path, dry_run: bool) -> Result<RotationReport> {
        let scan = scan_destination(destination)?;
        Ok(self.rotate_with(scan, dry_run, |path| std::fs::remove_file(path)))
    }

    /// Apply the policy to a scan, deleting through `remove`.
    ///
    /// Deletion is best effort per archive: a failure is logged and
    /// recorded, and rotation moves on to the next archive.
    pub fn rotate_with(
        &self,
        scan: DestinationScan,
        dry_run: bool,
        mut remove: impl FnMut(&Path) -> std::io::Result<()>,
    ) -> RotationReport {
        let mut report = RotationReport {
            unrecognized: scan.unrecognized,
            dry_run,
            ..RotationReport::default()
        };

        for path in &report.unrecognized {
            warn!(path = %path.display(), "Unrecognized archive name, skipping rotation for it");
        }

        if scan.archives.is_empty() {
            info!("No archives to rotate");
            return report;
        }

        let tags = classify(&scan.archives, &self.policy);
        let mut candidates: Vec<(ArchiveRecord, RetentionTag)> =
            scan.archives.into_iter().zip(tags).collect();
        candidates.sort_by(|(a, _), (b, _)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });

        for (archive, tag) in candidates {
            if tag != RetentionTag::Unretained {
                report.kept.push((archive, tag));
                continue;
            }

            if dry_run {
                info!(archive = %archive.name, "Dry run: would delete archive");
                report.deleted.push(archive);
                continue;
            }

            if let Err(e) = remove(&archive.path) {
                warn!(archive = %archive.name, error = %e, "Failed to delete archive");
                report.failed.push((archive, e.to_string()));
                continue;
            }

            if let Some(digest) = &archive.digest_path {
                if let Err(e) = remove(digest) {
                    warn!(path = %digest.display(), error = %e, "Failed to delete digest sidecar");
                    report.sidecar_failures.push((digest.clone(), e.to_string()));
                }
            }

            info!(archive = %archive.name, "Deleted archive");
            report.deleted.push(archive);
        }

        info!(
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            sidecars_left = report.sidecar_failures.len(),
            unrecognized = report.unrecognized.len(),
            dry_run,
            "Rotation complete"
        );

        report
    }
}
