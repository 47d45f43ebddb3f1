//! Build declarations.
//!
//! A declaration is an ordered list of named stages written in TOML:
//!
//! ```toml
//! name = "assistant"
//! target = "runner"
//!
//! [[stage]]
//! name = "base"
//! base = { image = "python:3.7-slim" }
//!
//! [[stage.steps]]
//! op = "install"
//! packages = ["libpq-dev"]
//! tier = "build_and_run"
//!
//! [[stage]]
//! name = "runner"
//! base = { stage = "base" }
//! ```

mod instruction;

pub use instruction::{Instruction, PortProtocol};

use crate::errors::BuildError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What a stage starts from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseRef {
    /// An external, immutable base image resolved through the config.
    Image(String),
    /// The completed filesystem of a previously declared stage.
    Stage(String),
    /// An empty filesystem.
    Scratch,
}

impl BaseRef {
    /// Returns the referenced stage, if the base is a stage.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Stage(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(name) => write!(f, "{name}"),
            Self::Stage(name) => write!(f, "stage:{name}"),
            Self::Scratch => write!(f, "scratch"),
        }
    }
}

/// One declared stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDeclaration {
    /// Unique stage name.
    pub name: String,
    /// Starting filesystem.
    pub base: BaseRef,
    /// Paths other stages may copy out of this one.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Instruction>,
}

/// A complete build declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDeclaration {
    /// Image name.
    pub name: String,
    /// Stage whose filesystem becomes the image; defaults to the last stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Build context directory, relative to the declaration file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PathBuf>,
    /// Stages in declaration order.
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDeclaration>,
}

impl BuildDeclaration {
    /// Parses a declaration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the text is not a valid declaration.
    pub fn from_toml_str(text: &str) -> Result<Self, BuildError> {
        toml::from_str(text).map_err(|e| BuildError::Serialization(e.to_string()))
    }

    /// Loads a declaration from a file.
    ///
    /// A relative `context` is resolved against the file's directory; a
    /// missing one defaults to that directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let text = std::fs::read_to_string(path)?;
        let mut declaration = Self::from_toml_str(&text)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        declaration.context = Some(match declaration.context.take() {
            Some(ctx) if ctx.is_absolute() => ctx,
            Some(ctx) => dir.join(ctx),
            None => dir.to_path_buf(),
        });
        Ok(declaration)
    }

    /// Returns the name of the target stage.
    #[must_use]
    pub fn target_name(&self) -> Option<&str> {
        self.target
            .as_deref()
            .or_else(|| self.stages.last().map(|s| s.name.as_str()))
    }

    /// Returns the build context directory.
    #[must_use]
    pub fn context_dir(&self) -> PathBuf {
        self.context.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}
