//! Native dependency installation.
//!
//! A [`PackageManager`] puts system packages into a stage root. The
//! [`DependencyInstaller`] wraps it with the stage bookkeeping: a stage's
//! installed set only grows after the package manager reports success, and
//! a failure is never retried.

use crate::config::InstallerConfig;
use crate::core::{Dependency, DependencyTier};
use crate::errors::BuildError;
use crate::utils::process::run_command;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Failure reported by a package manager.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct PackageManagerError {
    /// Diagnostics from the package manager.
    pub reason: String,
}

impl PackageManagerError {
    /// Creates a new error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Installs system packages into a root filesystem.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Installs every package in `packages` into `root`, or none of them.
    async fn install(&self, root: &Path, packages: &[String]) -> Result<(), PackageManagerError>;
}

/// Runs a configured argument vector.
///
/// `{root}` is replaced inside every argument; an argument that is exactly
/// `{packages}` expands to one argument per package.
#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    template: Vec<String>,
}

impl CommandPackageManager {
    /// Creates a package manager from the installer configuration.
    #[must_use]
    pub fn new(config: &InstallerConfig) -> Self {
        Self {
            template: config.command.clone(),
        }
    }

    /// Expands the template for one invocation.
    #[must_use]
    pub fn command_line(&self, root: &Path, packages: &[String]) -> Vec<String> {
        let root = root.display().to_string();
        let mut argv = Vec::with_capacity(self.template.len() + packages.len());
        for arg in &self.template {
            if arg == "{packages}" {
                argv.extend(packages.iter().cloned());
            } else {
                argv.push(arg.replace("{root}", &root));
            }
        }
        argv
    }
}

#[async_trait]
impl PackageManager for CommandPackageManager {
    async fn install(&self, root: &Path, packages: &[String]) -> Result<(), PackageManagerError> {
        let argv = self.command_line(root, packages);
        debug!(command = ?argv, "Running package manager");

        let mut env = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }

        let output = run_command(&argv, root, &env)
            .await
            .map_err(|e| PackageManagerError::new(format!("cannot start '{}': {e}", argv.join(" "))))?;

        if output.success() {
            Ok(())
        } else {
            Err(PackageManagerError::new(output.failure_summary()))
        }
    }
}

/// Stage-aware front end of a [`PackageManager`].
#[derive(Clone)]
pub struct DependencyInstaller {
    manager: Arc<dyn PackageManager>,
}

impl std::fmt::Debug for DependencyInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyInstaller").finish_non_exhaustive()
    }
}

impl DependencyInstaller {
    /// Creates an installer over a package manager.
    #[must_use]
    pub fn new(manager: Arc<dyn PackageManager>) -> Self {
        Self { manager }
    }

    /// Installs `packages` for step `step` of `stage`.
    ///
    /// On success every package is recorded in `installed` with `tier`; a
    /// package already recorded as build-and-run keeps that tier. On
    /// failure `installed` is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::DependencyInstall`] if the package manager fails.
    pub async fn install(
        &self,
        stage: &str,
        step: usize,
        root: &Path,
        packages: &[String],
        tier: DependencyTier,
        installed: &mut BTreeMap<String, DependencyTier>,
    ) -> Result<(), BuildError> {
        info!(stage = %stage, step, tier = %tier, "Installing {}", packages.join(" "));

        self.manager
            .install(root, packages)
            .await
            .map_err(|e| BuildError::DependencyInstall {
                stage: stage.to_string(),
                step,
                packages: packages.to_vec(),
                reason: e.reason,
            })?;

        for name in packages {
            let entry = installed.entry(name.clone()).or_insert(tier);
            *entry = (*entry).max(tier);
        }
        Ok(())
    }
}

/// Lists the dependencies that may be present at run time.
#[must_use]
pub fn runtime_dependencies(installed: &BTreeMap<String, DependencyTier>) -> BTreeSet<Dependency> {
    installed
        .iter()
        .filter(|(_, tier)| **tier == DependencyTier::BuildAndRun)
        .map(|(name, tier)| Dependency::new(name.clone(), *tier))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::always;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_command_line_expansion() {
        let manager = CommandPackageManager::new(&InstallerConfig::default());
        let argv = manager.command_line(Path::new("/work/rootfs"), &names(&["libpq-dev", "curl"]));

        assert_eq!(argv[0], "apt-get");
        assert!(argv.contains(&"Dir=/work/rootfs".to_string()));
        assert!(argv.contains(&"DPkg::Options::=--root=/work/rootfs".to_string()));
        assert_eq!(&argv[argv.len() - 2..], &["libpq-dev".to_string(), "curl".to_string()]);
    }

    #[tokio::test]
    async fn test_command_package_manager_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CommandPackageManager::new(&InstallerConfig {
            command: names(&["/bin/sh", "-c", "echo 'E: Unable to locate package' >&2; exit 100"]),
        });

        let err = manager.install(tmp.path(), &names(&["nope"])).await.unwrap_err();
        assert!(err.reason.contains("Unable to locate package"));
    }

    #[tokio::test]
    async fn test_installer_records_on_success() {
        let mut mock = MockPackageManager::new();
        mock.expect_install()
            .with(always(), always())
            .times(2)
            .returning(|_, _| Ok(()));

        let installer = DependencyInstaller::new(Arc::new(mock));
        let mut installed = BTreeMap::new();
        installer
            .install("base", 0, Path::new("/"), &names(&["libpq-dev"]), DependencyTier::BuildAndRun, &mut installed)
            .await
            .unwrap();
        installer
            .install("base", 1, Path::new("/"), &names(&["libpq-dev", "gcc"]), DependencyTier::BuildOnly, &mut installed)
            .await
            .unwrap();

        assert_eq!(installed["libpq-dev"], DependencyTier::BuildAndRun);
        assert_eq!(installed["gcc"], DependencyTier::BuildOnly);
        let runtime = runtime_dependencies(&installed);
        assert_eq!(runtime.len(), 1);
        assert!(runtime.contains(&Dependency::build_and_run("libpq-dev")));
    }

    #[tokio::test]
    async fn test_installer_failure_leaves_set_untouched() {
        let mut mock = MockPackageManager::new();
        mock.expect_install()
            .times(1)
            .returning(|_, _| Err(PackageManagerError::new("unable to locate package libfoo")));

        let installer = DependencyInstaller::new(Arc::new(mock));
        let mut installed = BTreeMap::new();
        let err = installer
            .install("builder", 3, Path::new("/"), &names(&["libfoo"]), DependencyTier::BuildOnly, &mut installed)
            .await
            .unwrap_err();

        assert!(installed.is_empty());
        match err {
            BuildError::DependencyInstall { stage, step, packages, reason } => {
                assert_eq!(stage, "builder");
                assert_eq!(step, 3);
                assert_eq!(packages, vec!["libfoo".to_string()]);
                assert!(reason.contains("libfoo"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
