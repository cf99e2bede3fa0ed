//! Archive codec: tar streams compressed with zstd.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::snapshot::Snapshot;
use crate::fs::{walk_directory, ExcludeMatcher, WalkOptions};

/// Incremental state handed to the codec
#[derive(Debug, Clone, Copy)]
pub enum IncrementalState<'a> {
    /// Full archive; any existing snapshot is neither read nor written
    Neutral,
    /// Store only entries changed since this snapshot and return its
    /// successor. A missing snapshot yields a full archive.
    Snapshot(&'a Path),
}

/// What the codec wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries written (files, directories, symlinks)
    pub entries: usize,
    /// Regular-file bytes written, before compression
    pub bytes: u64,
    /// Files skipped as unchanged since the snapshot
    pub unchanged: usize,
    /// Snapshot entries that no longer exist in the source
    pub deleted: usize,
    /// True if a previous snapshot was used
    pub incremental: bool,
}

/// Result of writing an archive
#[derive(Debug, Clone, Default)]
pub struct ArchiveWrite {
    pub stats: ArchiveStats,
    /// State for the next incremental run, present for `IncrementalState::Snapshot`.
    /// Not yet saved: the caller commits it once the archive has been verified.
    pub snapshot: Option<Snapshot>,
}

/// Capability to create, list and extract archives
pub trait ArchiveCodec: Send + Sync {
    /// Write an archive of `source` to `output`. Never modifies incremental state.
    fn create_archive(
        &self,
        output: &Path,
        source: &Path,
        excludes: &[String],
        state: IncrementalState<'_>,
    ) -> anyhow::Result<ArchiveWrite>;

    /// Entry paths in archive order, read without extracting
    fn list_entries(&self, archive: &Path) -> anyhow::Result<Vec<PathBuf>>;

    fn extract(&self, archive: &Path, target: &Path) -> anyhow::Result<()>;
}

/// `.tar.zst` codec
#[derive(Debug, Clone)]
pub struct TarZstdCodec {
    level: i32,
}

impl TarZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for TarZstdCodec {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ArchiveCodec for TarZstdCodec {
    fn create_archive(
        &self,
        output: &Path,
        source: &Path,
        excludes: &[String],
        state: IncrementalState<'_>,
    ) -> anyhow::Result<ArchiveWrite> {
        let options = WalkOptions {
            follow_links: false,
            exclude: ExcludeMatcher::new(excludes)?,
        };
        let files = walk_directory(source, &options)?;

        let previous = match state {
            IncrementalState::Neutral => None,
            IncrementalState::Snapshot(path) => {
                let snapshot = Snapshot::load(path)?;
                if snapshot.is_none() {
                    info!(snapshot = %path.display(), "No previous snapshot, creating full archive");
                }
                snapshot
            }
        };

        let mut stats = ArchiveStats {
            incremental: previous.is_some(),
            deleted: previous.as_ref().map(|p| p.deleted_count(&files)).unwrap_or(0),
            ..ArchiveStats::default()
        };

        let file = File::create(output)?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), self.level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for entry in &files {
            if let Some(previous) = &previous {
                if previous.is_unchanged(entry) {
                    stats.unchanged += 1;
                    continue;
                }
            }

            if entry.is_dir {
                builder.append_dir(&entry.relative_path, &entry.path)?;
            } else {
                builder.append_path_with_name(&entry.path, &entry.relative_path)?;
                if !entry.is_symlink {
                    stats.bytes += entry.size;
                }
            }
            stats.entries += 1;
        }

        let encoder = builder.into_inner()?;
        let writer = encoder.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let snapshot = match state {
            IncrementalState::Neutral => None,
            IncrementalState::Snapshot(_) => Some(Snapshot::from_files(&files)),
        };
        debug!(entries = stats.entries, unchanged = stats.unchanged, "Archive stream finished");

        Ok(ArchiveWrite { stats, snapshot })
    }

    fn list_entries(&self, archive: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let file = File::open(archive)?;
        let decoder = zstd::Decoder::new(file)?;
        let mut tar = tar::Archive::new(decoder);

        let mut entries = Vec::new();
        for entry in tar.entries()? {
            let entry = entry?;
            entries.push(entry.path()?.into_owned());
        }
        Ok(entries)
    }

    fn extract(&self, archive: &Path, target: &Path) -> anyhow::Result<()> {
        let file = File::open(archive)?;
        let decoder = zstd::Decoder::new(BufReader::new(file))?;
        let mut tar = tar::Archive::new(decoder);
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);
        tar.unpack(target)?;
        Ok(())
    }
}
