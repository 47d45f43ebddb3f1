//! Stage specifications.

use crate::core::{DependencyTier, EnvironmentRecord};
use crate::declaration::{BaseRef, Instruction, StageDeclaration};
use crate::errors::{codes, ContractErrorInfo, GraphValidationError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Specification for a single stage in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// What the stage starts from.
    pub base: BaseRef,
    /// Paths other stages may copy out of this one.
    pub outputs: Vec<PathBuf>,
    /// Ordered steps.
    pub steps: Vec<Instruction>,
}

impl StageSpec {
    /// Creates a new stage specification without steps.
    #[must_use]
    pub fn new(name: impl Into<String>, base: BaseRef) -> Self {
        Self {
            name: name.into(),
            base,
            outputs: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Declares an output path.
    #[must_use]
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Instruction) -> Self {
        self.steps.push(step);
        self
    }

    /// Names of the stages this stage depends on: its base stage and every
    /// `copy_from` source.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.base
            .stage()
            .into_iter()
            .chain(self.steps.iter().filter_map(Instruction::copy_source))
            .map(str::to_string)
            .collect()
    }

    /// Returns true if `path` is a declared output or lies below one.
    #[must_use]
    pub fn exposes(&self, path: &Path) -> bool {
        self.outputs.iter().any(|out| path.starts_with(out))
    }

    /// Environments created by this stage's own package steps.
    #[must_use]
    pub fn declared_environments(&self) -> Vec<EnvironmentRecord> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Instruction::Package {
                    prefix,
                    package,
                    extras,
                    ..
                } => Some(EnvironmentRecord {
                    prefix: prefix.clone(),
                    package: package.clone(),
                    extras: extras.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Steps that may not run in the runtime lineage, with their index.
    #[must_use]
    pub fn build_only_steps(&self) -> Vec<(usize, &Instruction)> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| {
                matches!(
                    step,
                    Instruction::Fetch { .. }
                        | Instruction::Package { .. }
                        | Instruction::Install {
                            tier: DependencyTier::BuildOnly,
                            ..
                        }
                )
            })
            .collect()
    }

    /// Validates the stage on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, the stage references itself,
    /// an output is relative, or a step is malformed.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        if self.name.trim().is_empty() {
            return Err(GraphValidationError::new("Stage name cannot be empty").with_error_info(
                ContractErrorInfo::new(codes::INVALID_STEP, "Stage has no name"),
            ));
        }

        if self.dependencies().contains(&self.name) {
            return Err(GraphValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::SELF_REFERENCE, format!("Stage '{}' references itself", self.name)),
            ));
        }

        if let Some(output) = self.outputs.iter().find(|o| !o.is_absolute()) {
            return Err(GraphValidationError::new(format!(
                "Stage '{}' declares relative output '{}'",
                self.name,
                output.display()
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(ContractErrorInfo::new(codes::INVALID_STEP, "Outputs must be absolute paths")));
        }

        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|reason| {
                GraphValidationError::new(format!("Stage '{}' step {index} ({}): {reason}", self.name, step.op()))
                    .with_stages(vec![self.name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::INVALID_STEP, reason)
                            .with_context_entry("step", index.to_string()),
                    )
            })?;
        }
        Ok(())
    }
}

impl From<&StageDeclaration> for StageSpec {
    fn from(decl: &StageDeclaration) -> Self {
        Self {
            name: decl.name.clone(),
            base: decl.base.clone(),
            outputs: decl.outputs.clone(),
            steps: decl.steps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(stage: &str, path: &str) -> Instruction {
        Instruction::CopyFrom {
            stage: stage.into(),
            src: path.into(),
            dest: path.into(),
        }
    }

    #[test]
    fn test_dependencies_include_base_and_copies() {
        let spec = StageSpec::new("runner", BaseRef::Stage("base".into()))
            .with_step(copy("builder", "/opt/venv"))
            .with_step(copy("builder", "/app/models"))
            .with_step(copy("assets", "/app/data"));

        let deps: Vec<String> = spec.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["assets", "base", "builder"]);
    }

    #[test]
    fn test_self_reference() {
        let spec = StageSpec::new("builder", BaseRef::Stage("builder".into()));
        let err = spec.validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::SELF_REFERENCE));

        let spec = StageSpec::new("builder", BaseRef::Scratch).with_step(copy("builder", "/x"));
        assert_eq!(spec.validate().unwrap_err().code(), Some(codes::SELF_REFERENCE));
    }

    #[test]
    fn test_exposes() {
        let spec = StageSpec::new("builder", BaseRef::Scratch).with_output("/opt/venv");
        assert!(spec.exposes(Path::new("/opt/venv")));
        assert!(spec.exposes(Path::new("/opt/venv/bin")));
        assert!(!spec.exposes(Path::new("/opt")));
        assert!(!spec.exposes(Path::new("/opt/venv2")));
    }

    #[test]
    fn test_invalid_step_reports_index() {
        let spec = StageSpec::new("builder", BaseRef::Scratch)
            .with_step(Instruction::Run { command: "true".into() })
            .with_step(Instruction::Workdir { path: "relative".into() });

        let err = spec.validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_STEP));
        assert!(err.message.contains("step 1"));
    }

    #[test]
    fn test_build_only_steps() {
        let spec = StageSpec::new("base", BaseRef::Scratch)
            .with_step(Instruction::Install {
                packages: vec!["libpq-dev".into()],
                tier: DependencyTier::BuildAndRun,
            })
            .with_step(Instruction::Install {
                packages: vec!["gcc".into()],
                tier: DependencyTier::BuildOnly,
            });

        let steps = spec.build_only_steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].0, 1);
    }
}
