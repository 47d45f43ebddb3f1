//! Error types for the stagebuild pipeline.
//!
//! Every error is fatal to a build run. Errors raised while a stage is
//! executing carry the stage name and the step index so the failing
//! instruction can be found in the linear instruction log.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stagebuild operations.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The stage graph failed static validation.
    #[error("{0}")]
    Validation(#[from] GraphValidationError),

    /// A cycle was detected in the stage graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A native dependency could not be installed.
    #[error("Dependency install failed in stage '{stage}' (step {step}): {packages:?}: {reason}")]
    DependencyInstall {
        /// The stage running the install.
        stage: String,
        /// Step index within the stage.
        step: usize,
        /// Packages requested by the step.
        packages: Vec<String>,
        /// Package manager diagnostics.
        reason: String,
    },

    /// An external artifact could not be fetched.
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// A named artifact was missing from the producing stage at copy time.
    #[error("{0}")]
    CrossStageReference(#[from] CrossStageReferenceError),

    /// The image could not be finalized.
    #[error("Finalization failed: {0}")]
    Finalization(String),

    /// A build command exited unsuccessfully.
    #[error("Step failed in stage '{stage}' (step {step}: {instruction}): {details}")]
    InstructionFailed {
        /// The stage running the step.
        stage: String,
        /// Step index within the stage.
        step: usize,
        /// Rendered instruction.
        instruction: String,
        /// Exit status and captured stderr.
        details: String,
    },

    /// A file from the build context could not be used.
    #[error("Build context error: {0}")]
    Context(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The build was cancelled.
    #[error("Build cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cyclic or missing stage reference, or another static rule.
    GraphValidation,
    /// Package unresolvable or install command failed.
    DependencyInstall,
    /// Remote asset unreachable or transfer incomplete.
    ArtifactFetch,
    /// Named artifact path absent in the producing stage.
    CrossStageReference,
    /// Permission or identity application failed.
    Finalization,
    /// A build command failed.
    Instruction,
    /// Anything else (io, config, cancellation).
    Other,
}

impl BuildError {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::CycleDetected(_) => ErrorKind::GraphValidation,
            Self::DependencyInstall { .. } => ErrorKind::DependencyInstall,
            Self::Fetch(_) => ErrorKind::ArtifactFetch,
            Self::CrossStageReference(_) => ErrorKind::CrossStageReference,
            Self::Finalization(_) => ErrorKind::Finalization,
            Self::InstructionFailed { .. } => ErrorKind::Instruction,
            _ => ErrorKind::Other,
        }
    }

    /// Returns the stage the error was raised in, when known.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::DependencyInstall { stage, .. } | Self::InstructionFailed { stage, .. } => {
                Some(stage)
            }
            Self::Fetch(e) => e.stage.as_deref(),
            Self::CrossStageReference(e) => Some(&e.consumer),
            _ => None,
        }
    }
}

/// Metadata about a validation error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info with the standard fix hint for
    /// `code`, if there is one.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        let code = code.into();
        let fix_hint = ContractSuggestions::get(&code).map(str::to_string);
        Self {
            code,
            summary: summary.into(),
            fix_hint,
            context: HashMap::new(),
        }
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when stage graph validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl GraphValidationError {
    /// Creates a new graph validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|i| i.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            codes::CYCLE,
            format!("Stage graph contains a cycle: {}", cycle_path.join(" -> ")),
        );

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for GraphValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error raised when an artifact fetch fails.
#[derive(Debug, Clone, Error)]
#[error("Fetch of '{locator}' failed{}: {reason}", stage.as_ref().map(|s| format!(" in stage '{s}'")).unwrap_or_default())]
pub struct FetchError {
    /// The external locator.
    pub locator: String,
    /// The stage performing the fetch.
    pub stage: Option<String>,
    /// What went wrong.
    pub reason: String,
}

impl FetchError {
    /// Creates a new fetch error.
    #[must_use]
    pub fn new(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            stage: None,
            reason: reason.into(),
        }
    }

    /// Attaches the stage name.
    #[must_use]
    pub fn in_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// Error raised when a copied path does not exist in the producing stage.
#[derive(Debug, Clone, Error)]
#[error("Stage '{consumer}' copies '{}' from stage '{producer}', but it does not exist there", path.display())]
pub struct CrossStageReferenceError {
    /// The stage performing the copy.
    pub consumer: String,
    /// The stage that should have produced the path.
    pub producer: String,
    /// The missing path.
    pub path: PathBuf,
}

impl CrossStageReferenceError {
    /// Creates a new cross-stage reference error.
    #[must_use]
    pub fn new(consumer: impl Into<String>, producer: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            consumer: consumer.into(),
            producer: producer.into(),
            path: path.into(),
        }
    }
}

/// Contract codes attached to validation errors.
pub mod codes {
    /// Stage references form a cycle.
    pub const CYCLE: &str = "GRAPH-CYCLE";
    /// A referenced stage does not exist.
    pub const MISSING_STAGE: &str = "GRAPH-MISSING_STAGE";
    /// A referenced stage is declared after its consumer.
    pub const FORWARD_REFERENCE: &str = "GRAPH-FORWARD_REFERENCE";
    /// A stage references itself.
    pub const SELF_REFERENCE: &str = "GRAPH-SELF_REFERENCE";
    /// Two stages share a name.
    pub const DUPLICATE_STAGE: &str = "GRAPH-DUPLICATE_STAGE";
    /// The declaration contains no stage.
    pub const EMPTY: &str = "GRAPH-EMPTY";
    /// A copy names a path outside the producer's declared outputs.
    pub const UNDECLARED_OUTPUT: &str = "GRAPH-UNDECLARED_OUTPUT";
    /// An environment is copied to a different prefix.
    pub const RELOCATED_ENVIRONMENT: &str = "GRAPH-RELOCATED_ENVIRONMENT";
    /// A build-time step sits in the runtime lineage.
    pub const RUNTIME_LEAK: &str = "GRAPH-RUNTIME_LEAK";
    /// A fetch step has no digest while digests are required.
    pub const MISSING_DIGEST: &str = "GRAPH-MISSING_DIGEST";
    /// A step is malformed.
    pub const INVALID_STEP: &str = "GRAPH-INVALID_STEP";
    /// The requested target stage does not exist.
    pub const UNKNOWN_TARGET: &str = "GRAPH-UNKNOWN_TARGET";
}

/// Fix hints for the contract error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets the fix hint for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            codes::CYCLE => Some(
                "Check `base` and `copy_from` references for circular chains. \
                 A stage may only build on or copy from stages declared before it.",
            ),
            codes::MISSING_STAGE => Some(
                "Ensure every `base` and `copy_from` names a stage in the declaration. \
                 Check for typos in stage names.",
            ),
            codes::FORWARD_REFERENCE => {
                Some("Declare stages before the stages that build on or copy from them.")
            }
            codes::SELF_REFERENCE => Some("Copy from or build on an earlier stage instead."),
            codes::DUPLICATE_STAGE => Some("Give every stage a unique name."),
            codes::EMPTY => Some("Add at least one stage to the declaration."),
            codes::UNDECLARED_OUTPUT => Some("List the path under the producing stage's `outputs` before copying it."),
            codes::RELOCATED_ENVIRONMENT => Some("Copy the environment to the same path it was built at."),
            codes::RUNTIME_LEAK => Some(
                "Move fetch, package and build-only install steps into a builder stage \
                 and copy the results into the runtime stage.",
            ),
            codes::MISSING_DIGEST => Some("Add `sha256` to the fetch step or disable `fetch.require_digest`."),
            codes::UNKNOWN_TARGET => Some("Set `target` to one of the declared stage names."),
            _ => None,
        }
    }
}
