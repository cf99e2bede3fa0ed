//! File system helpers: traversal with exclusions and free-space checks.

pub mod space;
pub mod walker;

pub use space::{SpaceChecker, SpaceProbe, StatvfsProbe};
pub use walker::{walk_directory, ExcludeMatcher, FileInfo, WalkOptions};
