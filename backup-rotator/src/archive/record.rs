//! Archive naming and destination enumeration.
//!
//! Archives are named `backup-YYYY-MM-DD-HHMM.tar.zst`. The timestamp in the
//! name, not the file's mtime, is the archive's creation time: copies and
//! restores rewrite mtimes, names survive them.

use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

pub const ARCHIVE_PREFIX: &str = "backup-";
pub const ARCHIVE_EXT: &str = ".tar.zst";
pub const DIGEST_EXT: &str = ".sha256";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M";
const TIMESTAMP_LEN: usize = "YYYY-MM-DD-HHMM".len();

/// One archive found at the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// `backup-YYYY-MM-DD-HHMM`, without extension
    pub name: String,
    pub path: PathBuf,
    pub digest_path: Option<PathBuf>,
    pub created_at: NaiveDateTime,
}

impl ArchiveRecord {
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, ARCHIVE_EXT)
    }

    pub fn size_bytes(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

/// Result of listing a destination once
#[derive(Debug, Clone, Default)]
pub struct DestinationScan {
    /// Archives whose names carry a valid timestamp
    pub archives: Vec<ArchiveRecord>,
    /// Files with the archive extension whose names do not parse
    pub unrecognized: Vec<PathBuf>,
}

/// Archive name (without extension) for a creation time
pub fn archive_name(created_at: NaiveDateTime) -> String {
    format!("{}{}", ARCHIVE_PREFIX, created_at.format(TIMESTAMP_FORMAT))
}

/// Archive file name for a creation time
pub fn archive_file_name(created_at: NaiveDateTime) -> String {
    format!("{}{}", archive_name(created_at), ARCHIVE_EXT)
}

/// Parse the creation time out of an archive name.
///
/// Accepts the bare name or the file name with its `.tar.zst` extension.
/// Anything that is not exactly `backup-` + a valid `YYYY-MM-DD-HHMM`
/// returns `None`.
pub fn parse_archive_name(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(ARCHIVE_EXT).unwrap_or(name);
    let timestamp = stem.strip_prefix(ARCHIVE_PREFIX)?;

    if timestamp.len() != TIMESTAMP_LEN || !timestamp.is_ascii() {
        return None;
    }

    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()
}

/// Digest sidecar path for an archive: the archive path plus `.sha256`
pub fn digest_path_for(archive: &Path) -> PathBuf {
    let mut os = archive.as_os_str().to_os_string();
    os.push(DIGEST_EXT);
    PathBuf::from(os)
}

/// Resolve an archive reference.
///
/// An existing file path wins; otherwise the reference is looked up as a
/// name in `destination`, first as given, then with `.tar.zst` appended.
pub fn resolve_archive(destination: &Path, archive_ref: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(archive_ref);
    if direct.is_file() {
        return Some(direct);
    }

    [
        destination.join(archive_ref),
        destination.join(format!("{}{}", archive_ref, ARCHIVE_EXT)),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

/// List every archive at `destination`, once.
///
/// Only regular files ending in `.tar.zst` are considered. A missing
/// destination is an empty scan.
pub fn scan_destination(destination: &Path) -> std::io::Result<DestinationScan> {
    let mut scan = DestinationScan::default();

    let read_dir = match std::fs::read_dir(destination) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e),
    };

    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(ARCHIVE_EXT) else {
            continue;
        };

        let path = entry.path();
        match parse_archive_name(stem) {
            Some(created_at) => {
                let digest = digest_path_for(&path);
                scan.archives.push(ArchiveRecord {
                    name: stem.to_string(),
                    digest_path: digest.is_file().then_some(digest),
                    path,
                    created_at,
                });
            }
            None => scan.unrecognized.push(path),
        }
    }

    scan.archives
        .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
    scan.unrecognized.sort();

    Ok(scan)
}
