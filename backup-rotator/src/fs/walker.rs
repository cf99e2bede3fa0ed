//! Directory traversal with exclusion globs.
//!
//! Produces the ordered entry list the archive codec writes. Paths are
//! relative to the walked root; the root itself is never an entry.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Compiled exclusion globs.
///
/// A pattern excludes an entry when it matches either the entry's path
/// relative to the root or its bare file name. `*` also matches `/`, so
/// `cache/*` excludes everything below `cache`, and `*.tmp` excludes
/// temporary files at any depth. An excluded directory prunes its subtree.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }

    pub fn is_excluded(&self, relative_path: &Path) -> bool {
        if self.set.is_empty() {
            return false;
        }

        if self.set.is_match(relative_path) {
            return true;
        }

        relative_path
            .file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Entries to leave out
    pub exclude: ExcludeMatcher,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude: ExcludeMatcher::empty(),
        }
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            relative_path,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mtime: metadata.mtime(),
            is_dir: metadata.is_dir(),
            is_symlink: entry.path_is_symlink(),
            path,
        })
    }
}

/// Walk a directory tree and collect every non-excluded entry,
/// directories included, parents before children, siblings sorted by name.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, root, &options.exclude));

    for entry in walker {
        let entry = entry?;
        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

/// Calculate total size of all regular files that would be archived
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    Ok(walk_directory(root, options)?
        .iter()
        .filter(|f| !f.is_dir)
        .map(|f| f.size)
        .sum())
}

fn should_exclude(entry: &DirEntry, root: &Path, exclude: &ExcludeMatcher) -> bool {
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    exclude.is_excluded(relative)
}
