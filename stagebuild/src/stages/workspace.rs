//! Per-stage working directories.
//!
//! Layout under the build's work directory:
//!
//! ```text
//! stages/<name>/rootfs    the stage root filesystem
//! stages/<name>/staging   downloads in flight, outside the root
//! ```

use crate::utils::fs::{remove_tree, rooted};
use std::io;
use std::path::{Path, PathBuf};

/// The directories owned by one stage.
#[derive(Debug, Clone)]
pub struct StageWorkspace {
    dir: PathBuf,
    rootfs: PathBuf,
}

impl StageWorkspace {
    /// Creates a fresh workspace for `stage`, clearing leftovers.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn create(work_dir: &Path, stage: &str) -> io::Result<Self> {
        let dir = work_dir.join("stages").join(stage);
        if dir.exists() {
            remove_tree(&dir)?;
        }
        let rootfs = dir.join("rootfs");
        std::fs::create_dir_all(&rootfs)?;
        Ok(Self { dir, rootfs })
    }

    /// Host path of the root filesystem.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Host directory for in-flight downloads.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join("staging")
    }

    /// Maps an absolute image path into the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the path escapes the root.
    pub fn path(&self, image_path: &Path) -> io::Result<PathBuf> {
        rooted(&self.rootfs, image_path)
    }
}
