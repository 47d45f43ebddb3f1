//! Isolated environment builds.
//!
//! The application and its optional extras are installed into a prefix
//! that is addressed at the same absolute path in every stage. Builds run
//! at the prefix's host location under the stage root; [`relocate_tree`]
//! then strips the root from everything the tools recorded.

mod relocate;

pub use relocate::{host_references, relocate_tree};

use crate::config::PackageBuilderConfig;
use crate::core::EnvironmentRecord;
use crate::utils::fs::rooted;
use crate::utils::process::run_command;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// What to install and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Absolute prefix inside the stage.
    pub prefix: PathBuf,
    /// Application name.
    pub package: String,
    /// Optional feature extras.
    pub extras: Vec<String>,
    /// Local source inside the stage, installed instead of the name.
    pub source: Option<PathBuf>,
}

impl EnvironmentSpec {
    /// Creates a spec installing `package` by name into `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<PathBuf>, package: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            package: package.into(),
            extras: Vec::new(),
            source: None,
        }
    }

    /// Sets the extras.
    #[must_use]
    pub fn with_extras(mut self, extras: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extras = extras.into_iter().map(Into::into).collect();
        self
    }

    /// Installs from a local source path instead of by name.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Renders the install requirement, e.g. `assistant[spacy,transformers]`.
    ///
    /// `source` is the host path of the local source, when there is one.
    #[must_use]
    pub fn requirement(&self, source: Option<&Path>) -> String {
        let base = source.map_or_else(|| self.package.clone(), |p| p.display().to_string());
        if self.extras.is_empty() {
            base
        } else {
            format!("{base}[{}]", self.extras.join(","))
        }
    }

    /// The record left behind by a successful build.
    #[must_use]
    pub fn record(&self) -> EnvironmentRecord {
        EnvironmentRecord {
            prefix: self.prefix.clone(),
            package: self.package.clone(),
            extras: self.extras.clone(),
        }
    }
}

/// Failure reported by a package builder.
#[derive(Debug, Clone, Error)]
#[error("{command}: {reason}")]
pub struct PackageBuildError {
    /// The command that failed.
    pub command: String,
    /// Exit status and diagnostics.
    pub reason: String,
}

impl PackageBuildError {
    /// Creates a new error.
    #[must_use]
    pub fn new(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Builds isolated environments inside a stage root.
#[async_trait]
pub trait PackageBuilder: Send + Sync {
    /// Creates the environment described by `spec` under `root`.
    ///
    /// `env` is the stage environment at the time of the step.
    async fn build(
        &self,
        spec: &EnvironmentSpec,
        root: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PackageBuildError>;
}

/// Runs the configured create and install commands.
#[derive(Debug, Clone)]
pub struct CommandPackageBuilder {
    create: Vec<String>,
    install: Vec<String>,
}

impl CommandPackageBuilder {
    /// Creates a builder from its configuration.
    #[must_use]
    pub fn new(config: &PackageBuilderConfig) -> Self {
        Self {
            create: config.create.clone(),
            install: config.install.clone(),
        }
    }

    fn expand(template: &[String], prefix: &str, requirement: &str) -> Vec<String> {
        template
            .iter()
            .map(|arg| arg.replace("{prefix}", prefix).replace("{requirement}", requirement))
            .collect()
    }

    /// Expands both templates for `spec` under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix or source escapes the root.
    pub fn command_lines(
        &self,
        spec: &EnvironmentSpec,
        root: &Path,
    ) -> Result<(Vec<String>, Vec<String>), PackageBuildError> {
        let prefix = rooted(root, &spec.prefix)
            .map_err(|e| PackageBuildError::new("package", e.to_string()))?;
        let source = spec
            .source
            .as_deref()
            .map(|s| rooted(root, s))
            .transpose()
            .map_err(|e| PackageBuildError::new("package", e.to_string()))?;

        let prefix = prefix.display().to_string();
        let requirement = spec.requirement(source.as_deref());
        Ok((
            Self::expand(&self.create, &prefix, &requirement),
            Self::expand(&self.install, &prefix, &requirement),
        ))
    }
}

#[async_trait]
impl PackageBuilder for CommandPackageBuilder {
    async fn build(
        &self,
        spec: &EnvironmentSpec,
        root: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PackageBuildError> {
        let (create, install) = self.command_lines(spec, root)?;
        let mut env = env.clone();
        env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        info!(prefix = %spec.prefix.display(), "Building environment for {}", spec.requirement(None));

        for argv in [create, install] {
            let line = argv.join(" ");
            debug!(command = %line, "Running package builder");
            let output = run_command(&argv, root, &env)
                .await
                .map_err(|e| PackageBuildError::new(&line, e.to_string()))?;
            if !output.success() {
                return Err(PackageBuildError::new(line, output.failure_summary()));
            }
        }
        Ok(())
    }
}
