//! Rewriting of build paths inside an environment.
//!
//! Environment tools record the absolute path they were created at in
//! scripts, shebangs and config files. On the host that path lies under the
//! stage root; inside the image it must be the bare prefix. After a build
//! every occurrence of the stage root is stripped so `<root>/opt/venv`
//! becomes `/opt/venv`.

use regex::bytes::{NoExpand, Regex};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Bytecode caches embed source paths in a binary format and are
/// regenerated by the interpreter, so they are dropped instead of rewritten.
const BYTECODE_CACHE: &str = "__pycache__";

fn root_pattern(host_root: &Path) -> io::Result<Regex> {
    let root = host_root.to_string_lossy();
    let root = root.trim_end_matches('/');
    Regex::new(&format!("{}/?", regex::escape(root))).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn is_binary(data: &[u8]) -> bool {
    data.contains(&0)
}

/// Strips `host_root` from every file and symlink under `tree`.
///
/// Returns the number of entries rewritten.
///
/// # Errors
///
/// Returns an error if the tree cannot be read or written, or if a binary
/// file refers to the stage root and so cannot be rewritten.
pub fn relocate_tree(tree: &Path, host_root: &Path) -> io::Result<usize> {
    let pattern = root_pattern(host_root)?;
    let mut caches = Vec::new();
    let mut rewritten = 0;

    let mut walker = WalkDir::new(tree).follow_links(false).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if entry.file_name() == BYTECODE_CACHE {
                caches.push(entry.path().to_path_buf());
                walker.skip_current_dir();
            }
            continue;
        }

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let bytes = target.to_string_lossy();
            if pattern.is_match(bytes.as_bytes()) {
                let relocated = pattern.replace_all(bytes.as_bytes(), NoExpand(b"/"));
                fs::remove_file(entry.path())?;
                std::os::unix::fs::symlink(String::from_utf8_lossy(&relocated).as_ref(), entry.path())?;
                rewritten += 1;
            }
            continue;
        }

        let data = fs::read(entry.path())?;
        if !pattern.is_match(&data) {
            continue;
        }
        if is_binary(&data) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is binary and refers to the build root {}",
                    entry.path().display(),
                    host_root.display()
                ),
            ));
        }
        fs::write(entry.path(), pattern.replace_all(&data, NoExpand(b"/")))?;
        rewritten += 1;
    }

    for cache in caches {
        fs::remove_dir_all(cache)?;
    }
    Ok(rewritten)
}

/// Lists entries under `tree` whose content or link target mentions
/// `host_root`.
///
/// # Errors
///
/// Returns an error if the tree cannot be read.
pub fn host_references(tree: &Path, host_root: &Path) -> io::Result<Vec<PathBuf>> {
    let pattern = root_pattern(host_root)?;
    let mut found = Vec::new();

    for entry in WalkDir::new(tree).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();
        let hit = if file_type.is_symlink() {
            pattern.is_match(fs::read_link(entry.path())?.to_string_lossy().as_bytes())
        } else if file_type.is_file() {
            pattern.is_match(&fs::read(entry.path())?)
        } else {
            false
        };
        if hit {
            found.push(entry.path().to_path_buf());
        }
    }
    Ok(found)
}
