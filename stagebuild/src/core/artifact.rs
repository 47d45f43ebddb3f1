//! Artifact and environment records produced by stages.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A file or directory copied out of a completed stage.
///
/// Artifacts are only visible to other stages through an explicit
/// `copy_from` step; nothing else in a stage's filesystem crosses over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The stage that produced the artifact.
    pub producer: String,
    /// Absolute path inside the producer's filesystem.
    pub source: PathBuf,
    /// Absolute path inside the consumer's filesystem.
    pub destination: PathBuf,
    /// SHA-256 over the copied tree.
    pub digest: String,
}

impl Artifact {
    /// Creates a new artifact record.
    #[must_use]
    pub fn new(
        producer: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            producer: producer.into(),
            source: source.into(),
            destination: destination.into(),
            digest: digest.into(),
        }
    }
}

/// An isolated install prefix holding the application and its extras.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    /// Absolute prefix, identical in every stage that references it.
    pub prefix: PathBuf,
    /// The installed application.
    pub package: String,
    /// Optional feature extras.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

impl EnvironmentRecord {
    /// Directory holding the environment's executables.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    /// Returns true if `path` names the prefix or something inside it.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// An external asset retrieved during a build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedAsset {
    /// Stable external locator.
    pub locator: String,
    /// Absolute path of the file inside the stage.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the content.
    pub sha256: String,
}
