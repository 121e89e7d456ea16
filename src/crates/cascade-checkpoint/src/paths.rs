//! On-disk layout of the state tree
//!
//! ```text
//! <state_root>/<module>/<version>/summary.json
//! <state_root>/<module>/<version>/items/<sha256(repo)>.json
//! <state_root>/<module>/<version>/.cascade.lock
//! ```
//!
//! Module paths such as `github.com/acme/lib` become nested directories.

use crate::error::{Result, ValidationError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.json";
pub const ITEMS_DIR: &str = "items";
pub const LOCK_FILE: &str = ".cascade.lock";

/// Names the layout uses inside a version directory
const RESERVED_NAMES: [&str; 3] = [SUMMARY_FILE, ITEMS_DIR, LOCK_FILE];

fn check_segment(key: &str, segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('\\')
        || RESERVED_NAMES.contains(&segment)
    {
        return Err(ValidationError::InvalidPathSegment(key.to_string()).into());
    }
    Ok(())
}

/// Append the `/`-separated segments of `key` to `base`, rejecting traversal
pub(crate) fn push_segments(base: &Path, key: &str) -> Result<PathBuf> {
    let mut path = base.to_path_buf();
    for segment in key.split('/') {
        check_segment(key, segment)?;
        path.push(segment);
    }
    Ok(path)
}

/// Directory holding everything for one `(module, version)`.
///
/// The version is always a single segment, so a version directory of module
/// `a` can only share a path with module `a/<version>`'s directory, never
/// with its records.
pub fn key_dir(root: &Path, module: &str, version: &str) -> Result<PathBuf> {
    let module_dir = push_segments(root, module)?;
    if version.contains('/') {
        return Err(ValidationError::InvalidPathSegment(version.to_string()).into());
    }
    check_segment(version, version)?;
    Ok(module_dir.join(version))
}

pub fn summary_path(root: &Path, module: &str, version: &str) -> Result<PathBuf> {
    Ok(key_dir(root, module, version)?.join(SUMMARY_FILE))
}

pub fn items_dir(root: &Path, module: &str, version: &str) -> Result<PathBuf> {
    Ok(key_dir(root, module, version)?.join(ITEMS_DIR))
}

pub fn item_path(root: &Path, module: &str, version: &str, repo: &str) -> Result<PathBuf> {
    Ok(items_dir(root, module, version)?.join(item_file_name(repo)))
}

pub fn lock_path(root: &Path, module: &str, version: &str) -> Result<PathBuf> {
    Ok(key_dir(root, module, version)?.join(LOCK_FILE))
}

/// Item files are named by the hex SHA-256 of the repo identifier
pub fn item_file_name(repo: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    format!("{:x}.json", hasher.finalize())
}
