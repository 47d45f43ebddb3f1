//! Stage role and instruction outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The part a stage plays for a given build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// An ancestor of the target through `base` references.
    ///
    /// Everything installed here ends up in the image.
    Shared,
    /// A stage the target only copies artifacts from.
    Build,
    /// The target stage itself.
    Runtime,
    /// A stage the target does not need.
    Unused,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Build => write!(f, "build"),
            Self::Runtime => write!(f, "runtime"),
            Self::Unused => write!(f, "unused"),
        }
    }
}

/// Outcome of an executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The instruction completed.
    Ok,
    /// The instruction failed and aborted the build.
    Fail,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Fail => write!(f, "fail"),
        }
    }
}
