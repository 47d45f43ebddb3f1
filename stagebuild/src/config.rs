//! Build configuration.
//!
//! Loaded from a TOML file (usually `stagebuild.config.toml`); every field
//! has a default so an empty file is a valid configuration.

use crate::errors::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Search path used when a base image does not define one.
pub const DEFAULT_SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Top-level build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Scratch directory holding per-stage roots.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directory finalized images are published into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Upper bound on concurrently executing stages.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_stages: usize,
    /// Known external base images.
    #[serde(default)]
    pub bases: BTreeMap<String, BaseImageConfig>,
    /// Artifact fetcher settings.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Native package manager settings.
    #[serde(default)]
    pub installer: InstallerConfig,
    /// Isolated environment builder settings.
    #[serde(default)]
    pub package_builder: PackageBuilderConfig,
    /// Build command settings.
    #[serde(default)]
    pub run: RunConfig,
    /// Finalization settings.
    #[serde(default)]
    pub finalize: FinalizeConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".stagebuild/work")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".stagebuild/images")
}

fn default_max_parallel() -> usize {
    4
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            max_parallel_stages: default_max_parallel(),
            bases: BTreeMap::new(),
            fetch: FetchConfig::default(),
            installer: InstallerConfig::default(),
            package_builder: PackageBuilderConfig::default(),
            run: RunConfig::default(),
            finalize: FinalizeConfig::default(),
        }
    }
}

impl BuildConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a config error if the text is invalid.
    pub fn from_toml_str(text: &str) -> Result<Self, BuildError> {
        toml::from_str(text).map_err(|e| BuildError::Config(e.to_string()))
    }

    /// Loads a configuration file and applies environment overrides.
    ///
    /// Relative directories and base roots are resolved against the file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative(dir);
        Ok(config.with_env_overrides())
    }

    /// Applies `STAGEBUILD_WORK_DIR` and `STAGEBUILD_OUTPUT_DIR`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("STAGEBUILD_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("STAGEBUILD_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        self
    }

    /// Sets the work directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Registers a base image.
    #[must_use]
    pub fn with_base(mut self, name: impl Into<String>, base: BaseImageConfig) -> Self {
        self.bases.insert(name.into(), base);
        self
    }

    fn resolve_relative(&mut self, dir: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        fix(&mut self.work_dir);
        fix(&mut self.output_dir);
        for base in self.bases.values_mut() {
            if let Some(root) = base.root.as_mut() {
                fix(root);
            }
        }
    }
}

/// An external base image available locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseImageConfig {
    /// Unpacked root filesystem; `None` means an empty root.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Environment the base image defines.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Packages already present in the base image.
    #[serde(default)]
    pub packages: Vec<String>,
}

impl BaseImageConfig {
    /// Creates a base image rooted at `root`.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Configuration for artifact fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    /// User agent string.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Maximum asset size in bytes.
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Reject fetch steps without a `sha256`.
    #[serde(default)]
    pub require_digest: bool,
}

fn default_timeout() -> f64 {
    600.0
}

fn default_user_agent() -> String {
    concat!("stagebuild/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_size() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GiB
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
            max_size: default_max_size(),
            require_digest: false,
        }
    }
}

impl FetchConfig {
    /// Gets timeout as Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }
}

/// Native package manager command.
///
/// `{root}` expands to the stage root on the host and `{packages}` to the
/// package names as separate arguments. The default points both apt's state
/// (`Dir`) and dpkg's install root (`--root`) at the stage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Argument vector template.
    #[serde(default = "default_install_command")]
    pub command: Vec<String>,
}

fn default_install_command() -> Vec<String> {
    [
        "apt-get",
        "-o",
        "Dir={root}",
        "-o",
        "DPkg::Options::=--root={root}",
        "install",
        "-y",
        "--no-install-recommends",
        "{packages}",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
        }
    }
}

/// Isolated environment builder commands.
///
/// `{prefix}` expands to the environment prefix on the host and
/// `{requirement}` to `package[extra,...]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageBuilderConfig {
    /// Creates the empty environment.
    #[serde(default = "default_create_command")]
    pub create: Vec<String>,
    /// Installs the requirement into it.
    #[serde(default = "default_package_install_command")]
    pub install: Vec<String>,
}

fn default_create_command() -> Vec<String> {
    vec!["python3".into(), "-m".into(), "venv".into(), "{prefix}".into()]
}

fn default_package_install_command() -> Vec<String> {
    vec![
        "{prefix}/bin/pip".into(),
        "install".into(),
        "--no-cache-dir".into(),
        "--no-compile".into(),
        "{requirement}".into(),
    ]
}

impl Default for PackageBuilderConfig {
    fn default() -> Self {
        Self {
            create: default_create_command(),
            install: default_package_install_command(),
        }
    }
}

/// Build command settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Shell used for `run` steps; the command is appended.
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
}

fn default_shell() -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into()]
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

/// Finalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    /// Apply group 0 ownership on disk as well as in the exported layer.
    /// Requires privileges.
    #[serde(default)]
    pub apply_ownership: bool,
    /// Gzip the exported layer.
    #[serde(default = "default_compress")]
    pub compress: bool,
}

fn default_compress() -> bool {
    true
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            apply_ownership: false,
            compress: default_compress(),
        }
    }
}
