//! What a stage knows about its own filesystem.

use crate::core::{Artifact, Dependency, DependencyTier, EnvironmentRecord, FetchedAsset};
use crate::image::{EntrypointContract, ExposedPort, UserSpec};
use crate::install::runtime_dependencies;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// State of a stage; immutable once the stage completes.
///
/// A stage built on another stage starts from a copy of its parent's state
/// (with its own root), so everything recorded here flows down the base
/// lineage and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct StageState {
    /// Stage name.
    pub name: String,
    /// Host path of the stage root filesystem.
    pub rootfs: PathBuf,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub workdir: Option<PathBuf>,
    /// Execution identity.
    pub user: Option<UserSpec>,
    /// Installed native packages and their tier.
    pub dependencies: BTreeMap<String, DependencyTier>,
    /// Isolated environments present in the root.
    pub environments: Vec<EnvironmentRecord>,
    /// External assets fetched into the root.
    pub fetched: Vec<FetchedAsset>,
    /// Artifacts copied in from other stages.
    pub artifacts: Vec<Artifact>,
    /// Declared mount points.
    pub volumes: BTreeSet<PathBuf>,
    /// Declared ports.
    pub ports: BTreeSet<ExposedPort>,
    /// Paths normalized for group access.
    pub normalized: BTreeSet<PathBuf>,
    /// Entrypoint, if declared.
    pub entrypoint: Option<EntrypointContract>,
}

impl StageState {
    /// Creates an empty state.
    #[must_use]
    pub fn new(name: impl Into<String>, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            rootfs: rootfs.into(),
            ..Self::default()
        }
    }

    /// Derives the starting state of a stage built on `self`.
    #[must_use]
    pub fn inherit(&self, name: impl Into<String>, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            rootfs: rootfs.into(),
            ..self.clone()
        }
    }

    /// Records an environment, replacing one at the same prefix.
    pub fn add_environment(&mut self, record: EnvironmentRecord) {
        self.environments.retain(|e| e.prefix != record.prefix);
        self.environments.push(record);
    }

    /// Dependencies that may be present at run time.
    #[must_use]
    pub fn runtime_dependencies(&self) -> BTreeSet<Dependency> {
        runtime_dependencies(&self.dependencies)
    }

    /// Environments at or below `path`, or containing it.
    #[must_use]
    pub fn environments_touching(&self, path: &std::path::Path) -> Vec<EnvironmentRecord> {
        self.environments
            .iter()
            .filter(|e| e.contains(path) || e.prefix.starts_with(path))
            .cloned()
            .collect()
    }
}
