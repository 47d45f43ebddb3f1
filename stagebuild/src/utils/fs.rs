//! Filesystem helpers for stage roots.
//!
//! Image paths are always absolute (`/opt/venv`); on the host they live
//! under a stage root. [`rooted`] does the mapping and refuses paths that
//! would climb out of the root.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Maps an image path into a host root directory.
///
/// # Errors
///
/// Returns an error if the path escapes the root through `..`.
pub fn rooted(root: &Path, path: &Path) -> io::Result<PathBuf> {
    Ok(root.join(normalize(path)?))
}

/// Normalizes an image path to a relative path without `.`/`..`.
///
/// # Errors
///
/// Returns an error if the path climbs above `/`.
pub fn normalize(path: &Path) -> io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path escapes the stage root: {}", path.display()),
                    ));
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

/// Copies a file, symlink or directory tree from `src` to `dest`.
///
/// Permission bits are preserved and symlinks are recreated rather than
/// followed. Existing directories at `dest` are merged into. Returns the
/// number of bytes copied.
///
/// # Errors
///
/// Returns an error if `src` does not exist or any copy fails.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(src)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if !meta.is_dir() {
        return copy_entry(src, dest, &meta);
    }

    // Directory modes are applied once their children are in place, deepest
    // first, so read-only source directories stay writable during the copy.
    let mut dirs = Vec::new();
    let mut bytes = 0;
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(relative);
        let meta = entry.path().symlink_metadata()?;

        if meta.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((target, meta.mode() & 0o7777));
        } else {
            bytes += copy_entry(entry.path(), &target, &meta)?;
        }
    }

    for (dir, mode) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
    }
    Ok(bytes)
}

/// Removes a tree, first granting the owner write access to directories
/// that lack it.
///
/// # Errors
///
/// Returns an error if the tree cannot be removed.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(meta) = entry.path().symlink_metadata() {
            let mode = meta.mode() & 0o7777;
            if mode & 0o700 != 0o700 {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
            }
        }
    }
    fs::remove_dir_all(path)
}

fn copy_entry(src: &Path, dest: &Path, meta: &fs::Metadata) -> io::Result<u64> {
    if meta.file_type().is_symlink() {
        let link = fs::read_link(src)?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(dest)?;
        }
        std::os::unix::fs::symlink(link, dest)?;
        Ok(0)
    } else {
        fs::copy(src, dest)
    }
}

/// Computes a SHA-256 digest over a file or directory tree.
///
/// The digest covers relative paths, entry types, permission bits, symlink
/// targets and file contents, visited in sorted order, so identical trees
/// hash identically regardless of where they live.
///
/// # Errors
///
/// Returns an error if the tree cannot be read.
pub fn tree_digest(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
        let meta = entry.path().symlink_metadata()?;

        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update((meta.mode() & 0o7777).to_be_bytes());

        if meta.file_type().is_symlink() {
            hasher.update(b"L");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else if meta.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            let mut file = fs::File::open(entry.path())?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}
