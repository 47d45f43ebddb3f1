//! Group permission normalization.
//!
//! The image runs under an arbitrary non-root uid with group 0, so the
//! application tree must grant the group whatever it grants the owner.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Returns `mode` with the group bits replaced by the owner bits.
#[must_use]
pub const fn group_equals_owner(mode: u32) -> u32 {
    (mode & !0o070) | ((mode & 0o700) >> 3)
}

/// Recursively sets group bits equal to owner bits under `path`.
///
/// Symlinks are skipped. Returns the number of entries changed.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked or a mode cannot be set.
pub fn normalize_group(path: &Path) -> io::Result<usize> {
    let mut changed = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode() & 0o7777;
        let normalized = group_equals_owner(mode);
        if normalized != mode {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(normalized))?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Sets group 0 on every entry under `path`, not following symlinks.
///
/// # Errors
///
/// Returns an error if ownership cannot be changed (usually missing
/// privileges).
pub fn apply_group_zero(path: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        std::os::unix::fs::lchown(entry.path(), None, Some(0))?;
    }
    Ok(())
}

/// Lists entries under `path` whose group bits differ from their owner bits.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked.
pub fn audit_group_access(path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut offenders = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode() & 0o7777;
        if group_equals_owner(mode) != mode {
            offenders.push(entry.path().to_path_buf());
        }
    }
    Ok(offenders)
}
