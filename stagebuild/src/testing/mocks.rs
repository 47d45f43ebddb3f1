//! Deterministic service implementations for tests.

use crate::errors::FetchError;
use crate::fetch::ArtifactFetcher;
use crate::install::{PackageManager, PackageManagerError};
use crate::package::{EnvironmentSpec, PackageBuildError, PackageBuilder};
use crate::utils::fs::rooted;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Directory, inside a stage root, where installed packages leave a marker.
pub const INSTALLED_MARKER_DIR: &str = "/var/lib/stagebuild/installed";

/// A package manager that records installs and writes a marker file per
/// package.
///
/// With no availability list every package resolves.
#[derive(Debug, Default)]
pub struct RecordingPackageManager {
    available: Option<BTreeSet<String>>,
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl RecordingPackageManager {
    /// Creates a manager that resolves every package.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts resolvable packages to `packages`.
    #[must_use]
    pub fn with_available(mut self, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.available = Some(packages.into_iter().map(Into::into).collect());
        self
    }

    /// Every install request, in order, with the root it targeted.
    #[must_use]
    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PackageManager for RecordingPackageManager {
    async fn install(&self, root: &Path, packages: &[String]) -> Result<(), PackageManagerError> {
        self.calls.lock().push((root.to_path_buf(), packages.to_vec()));

        if let Some(available) = &self.available {
            let missing: Vec<&String> = packages.iter().filter(|p| !available.contains(*p)).collect();
            if !missing.is_empty() {
                return Err(PackageManagerError::new(format!("Unable to locate package {missing:?}")));
            }
        }

        let dir = rooted(root, Path::new(INSTALLED_MARKER_DIR)).map_err(|e| PackageManagerError::new(e.to_string()))?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PackageManagerError::new(e.to_string()))?;
        for package in packages {
            tokio::fs::write(dir.join(package), b"")
                .await
                .map_err(|e| PackageManagerError::new(e.to_string()))?;
        }
        Ok(())
    }
}

/// Serves fixed bytes per locator.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    assets: HashMap<String, Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    /// Creates a fetcher with no assets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an asset.
    #[must_use]
    pub fn with_asset(mut self, locator: impl Into<String>, content: impl AsRef<[u8]>) -> Self {
        self.assets.insert(locator.into(), content.as_ref().to_vec());
        self
    }

    /// Locators requested so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn download(&self, locator: &str, target: &Path) -> Result<u64, FetchError> {
        self.calls.lock().push(locator.to_string());
        let content = self
            .assets
            .get(locator)
            .ok_or_else(|| FetchError::new(locator, "unreachable: no such asset"))?;
        tokio::fs::write(target, content)
            .await
            .map_err(|e| FetchError::new(locator, e.to_string()))?;
        Ok(content.len() as u64)
    }
}

/// Fails every download as if the host could not be reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableFetcher;

#[async_trait]
impl ArtifactFetcher for UnreachableFetcher {
    async fn download(&self, locator: &str, _target: &Path) -> Result<u64, FetchError> {
        Err(FetchError::new(locator, "unreachable: connection refused"))
    }
}

/// Creates environments without a real interpreter: the prefix gets a
/// `bin/<package>` shell script that prints usage for `--help`, echoes the
/// known verbs `run`, `shell` and `train`, and exits 2 on anything else.
#[derive(Debug, Default)]
pub struct ScriptedPackageBuilder {
    builds: Mutex<Vec<(String, String)>>,
}

impl ScriptedPackageBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(prefix, requirement)` of every build, in order.
    #[must_use]
    pub fn builds(&self) -> Vec<(String, String)> {
        self.builds.lock().clone()
    }
}

#[async_trait]
impl PackageBuilder for ScriptedPackageBuilder {
    async fn build(
        &self,
        spec: &EnvironmentSpec,
        root: &Path,
        _env: &BTreeMap<String, String>,
    ) -> Result<(), PackageBuildError> {
        let fail = |e: std::io::Error| PackageBuildError::new("scripted build", e.to_string());
        let bin = rooted(root, &spec.prefix.join("bin")).map_err(fail)?;
        tokio::fs::create_dir_all(&bin).await.map_err(fail)?;

        let script = bin.join(&spec.package);
        let body = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             --help) echo \"usage: {0} <run|shell|train> [options]\"; exit 0 ;;\n\
             run|shell|train) echo \"{0}:$*\" ;;\n\
             *) echo \"{0}: unknown command '$1'\" >&2; exit 2 ;;\n\
             esac\n",
            spec.package
        );
        tokio::fs::write(&script, body).await.map_err(fail)?;
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(fail)?;

        self.builds
            .lock()
            .push((spec.prefix.display().to_string(), spec.requirement(None)));
        Ok(())
    }
}
