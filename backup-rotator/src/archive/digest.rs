//! SHA-256 digests and `.sha256` sidecar files.
//!
//! Sidecars use the `sha256sum` text format (`<hex>  <file name>`), so an
//! archive can also be checked by hand with `sha256sum -c`.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use super::record::digest_path_for;

const HEX_DIGEST_LEN: usize = 64;

/// Outcome of checking a file against its sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestCheck {
    Match,
    Mismatch { expected: String, actual: String },
    Unreadable(String),
}

impl DigestCheck {
    pub fn is_match(&self) -> bool {
        matches!(self, DigestCheck::Match)
    }

    /// Short reason for logs and errors; empty on a match
    pub fn describe(&self) -> String {
        match self {
            DigestCheck::Match => String::new(),
            DigestCheck::Mismatch { expected, actual } => {
                format!("expected {}, computed {}", expected, actual)
            }
            DigestCheck::Unreadable(reason) => reason.clone(),
        }
    }
}

/// Hex-encoded SHA-256 of a file's current bytes
pub fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the digest of `archive` and write it next to it.
///
/// The sidecar is written to a temporary name and renamed into place so a
/// reader never sees a half-written digest.
pub fn write_sidecar(archive: &Path) -> std::io::Result<PathBuf> {
    let digest = digest_file(archive)?;
    let sidecar = digest_path_for(archive);
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut tmp_os = sidecar.as_os_str().to_os_string();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}  {}", digest, file_name)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &sidecar)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result.map(|_| sidecar)
}

/// Read the expected digest out of a sidecar
pub fn read_sidecar(sidecar: &Path) -> Result<String, String> {
    let contents = std::fs::read_to_string(sidecar)
        .map_err(|e| format!("cannot read {}: {}", sidecar.display(), e))?;

    let expected = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| format!("{} is empty", sidecar.display()))?
        .to_ascii_lowercase();

    if expected.len() != HEX_DIGEST_LEN || !expected.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("{} does not contain a SHA-256 digest", sidecar.display()));
    }

    Ok(expected)
}

/// Check `file` against `sidecar`
pub fn verify(file: &Path, sidecar: &Path) -> DigestCheck {
    let expected = match read_sidecar(sidecar) {
        Ok(expected) => expected,
        Err(reason) => return DigestCheck::Unreadable(reason),
    };

    let actual = match digest_file(file) {
        Ok(actual) => actual,
        Err(e) => return DigestCheck::Unreadable(format!("cannot read {}: {}", file.display(), e)),
    };

    if expected == actual {
        DigestCheck::Match
    } else {
        DigestCheck::Mismatch { expected, actual }
    }
}
