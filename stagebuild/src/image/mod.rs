//! Finalized images.
//!
//! An image is a published directory holding the assembled root
//! filesystem, its exported layer and `config.json`. Images are created
//! once by the [`ImageFinalizer`] and never mutated afterwards.

mod entrypoint;
mod export;
mod finalizer;
mod launcher;
pub mod permissions;

pub use entrypoint::EntrypointContract;
pub use export::{export_layer, LayerInfo};
pub use finalizer::ImageFinalizer;
pub use launcher::{LaunchCommand, Launcher};

use crate::core::{Artifact, EnvironmentRecord};
use crate::declaration::PortProtocol;
use crate::errors::BuildError;
use crate::utils::env::split_search_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the image configuration.
pub const CONFIG_FILE: &str = "config.json";

/// Directory holding the image root filesystem.
pub const ROOTFS_DIR: &str = "rootfs";

/// A network port the image declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExposedPort {
    /// Port number.
    pub port: u16,
    /// Transport protocol.
    pub protocol: PortProtocol,
}

impl fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Numeric execution identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// The environment a launched image runs with.
///
/// Built once at finalization; there are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    env: BTreeMap<String, String>,
    search_path: Vec<String>,
    uid: u32,
    gid: u32,
    workdir: PathBuf,
}

impl RuntimeConfig {
    /// Creates a runtime config; the search path is taken from `PATH`.
    #[must_use]
    pub fn new(env: BTreeMap<String, String>, user: UserSpec, workdir: PathBuf) -> Self {
        let search_path = env.get("PATH").map(|p| split_search_path(p)).unwrap_or_default();
        Self {
            env,
            search_path,
            uid: user.uid,
            gid: user.gid,
            workdir,
        }
    }

    /// Environment variables.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Executable search path entries in priority order.
    #[must_use]
    pub fn search_path(&self) -> &[String] {
        &self.search_path
    }

    /// User id.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Group id.
    #[must_use]
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Working directory.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Content identifier, `sha256:<hex>`.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Stage the image was built from.
    pub target_stage: String,
    /// Creation time (ISO 8601).
    pub created: String,
    /// Launch environment and identity.
    pub runtime: RuntimeConfig,
    /// Entrypoint and default arguments.
    pub entrypoint: EntrypointContract,
    /// Declared ports.
    #[serde(default)]
    pub exposed_ports: Vec<ExposedPort>,
    /// Declared ephemeral mount points.
    #[serde(default)]
    pub volumes: Vec<PathBuf>,
    /// Native packages present at run time.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Isolated environments in the image.
    #[serde(default)]
    pub environments: Vec<EnvironmentRecord>,
    /// Artifacts copied in from other stages.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// The exported layer.
    pub layer: LayerInfo,
}

/// A finalized, published image.
#[derive(Debug, Clone)]
pub struct Image {
    dir: PathBuf,
    config: ImageConfig,
}

impl Image {
    pub(crate) fn new(dir: PathBuf, config: ImageConfig) -> Self {
        Self { dir, config }
    }

    /// Loads a published image.
    ///
    /// # Errors
    ///
    /// Returns an error if `config.json` is missing or invalid.
    pub fn load(dir: &Path) -> Result<Self, BuildError> {
        let text = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| BuildError::Serialization(format!("{}: {e}", dir.join(CONFIG_FILE).display())))?;
        Ok(Self::new(dir.to_path_buf(), config))
    }

    /// The published directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The image root filesystem.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.dir.join(ROOTFS_DIR)
    }

    /// The image configuration.
    #[must_use]
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Content identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// The runtime config.
    #[must_use]
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.config.runtime
    }

    /// The entrypoint contract.
    #[must_use]
    pub fn entrypoint(&self) -> &EntrypointContract {
        &self.config.entrypoint
    }

    /// Native packages present at run time.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.config.dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_search_path() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/opt/venv/bin:/usr/local/bin:/usr/bin".to_string());
        let runtime = RuntimeConfig::new(env, UserSpec { uid: 1001, gid: 0 }, PathBuf::from("/app"));

        assert_eq!(runtime.search_path()[0], "/opt/venv/bin");
        assert_eq!(runtime.search_path().len(), 3);
        assert_eq!(runtime.uid(), 1001);
        assert_eq!(runtime.workdir(), Path::new("/app"));
    }

    #[test]
    fn test_exposed_port_display() {
        let port = ExposedPort {
            port: 5005,
            protocol: PortProtocol::Tcp,
        };
        assert_eq!(port.to_string(), "5005/tcp");
    }
}
