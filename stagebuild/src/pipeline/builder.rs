//! Stage graph builder with validation.
//!
//! Everything that can be checked without touching the filesystem is
//! checked here, before any stage runs.

use super::{StageGraph, StageSpec};
use crate::config::BuildConfig;
use crate::core::EnvironmentRecord;
use crate::declaration::{BuildDeclaration, Instruction};
use crate::errors::{codes, ContractErrorInfo, CycleDetectedError, GraphValidationError};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Builder for creating validated stage graphs.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The image name.
    name: String,
    /// The stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Insertion order for stages.
    stage_order: Vec<String>,
    /// Stage whose filesystem becomes the image.
    target: Option<String>,
    /// Whether every fetch must carry a digest.
    require_digest: bool,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
            target: None,
            require_digest: false,
        }
    }

    /// Validates a whole declaration and loads its stages.
    ///
    /// Unknown references, duplicates and cycles are reported for the
    /// declaration as a whole, so a cycle is reported as a cycle even though
    /// it necessarily contains a forward reference.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn from_declaration(
        declaration: &BuildDeclaration,
        config: &BuildConfig,
    ) -> Result<Self, GraphValidationError> {
        if declaration.stages.is_empty() {
            return Err(empty_error());
        }

        let specs: Vec<StageSpec> = declaration.stages.iter().map(StageSpec::from).collect();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, spec) in specs.iter().enumerate() {
            spec.validate()?;
            if positions.insert(spec.name.as_str(), index).is_some() {
                return Err(duplicate_error(&spec.name));
            }
        }

        let deps: HashMap<String, BTreeSet<String>> = specs
            .iter()
            .map(|s| (s.name.clone(), s.dependencies()))
            .collect();

        for spec in &specs {
            if let Some(missing) = deps[&spec.name].iter().find(|d| !positions.contains_key(d.as_str())) {
                return Err(missing_error(&spec.name, missing));
            }
        }

        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        if let Some(cycle) = find_cycle(&order, &deps) {
            return Err(CycleDetectedError::new(cycle).into());
        }

        for (index, spec) in specs.iter().enumerate() {
            for dep in &deps[&spec.name] {
                if positions[dep.as_str()] > index {
                    return Err(GraphValidationError::new(format!(
                        "Stage '{}' references stage '{dep}', which is declared after it",
                        spec.name
                    ))
                    .with_stages(vec![spec.name.clone(), dep.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::FORWARD_REFERENCE, format!("Forward reference to '{dep}'")),
                    ));
                }
            }
        }

        let mut builder = Self::new(&declaration.name).require_digest(config.fetch.require_digest);
        builder.target.clone_from(&declaration.target);
        for spec in specs {
            builder.add_stage_spec(spec)?;
        }
        Ok(builder)
    }

    /// Adds a stage, failing on the first problem.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (missing dependency, cycle, etc.)
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, GraphValidationError> {
        self.add_stage_spec(spec)?;
        Ok(self)
    }

    /// Adds a stage with a specification.
    ///
    /// Every stage it references must already have been added.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), GraphValidationError> {
        spec.validate()?;

        if self.stages.contains_key(&spec.name) {
            return Err(duplicate_error(&spec.name));
        }

        for dep in spec.dependencies() {
            if !self.stages.contains_key(&dep) {
                return Err(missing_error(&spec.name, &dep));
            }
        }

        self.check_copies(&spec)?;

        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);

        let deps: HashMap<String, BTreeSet<String>> = self
            .stages
            .iter()
            .map(|(name, s)| (name.clone(), s.dependencies()))
            .collect();
        if let Some(cycle) = find_cycle(&self.stage_order, &deps) {
            return Err(CycleDetectedError::new(cycle).into());
        }

        Ok(())
    }

    /// Sets the target stage (default: the last stage added).
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Requires every fetch step to carry a digest.
    #[must_use]
    pub fn require_digest(mut self, required: bool) -> Self {
        self.require_digest = required;
        self
    }

    /// Builds the stage graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages, the target is
    /// unknown, the target's base lineage contains build-only steps, or a
    /// required digest is missing.
    pub fn build(self) -> Result<StageGraph, GraphValidationError> {
        let Some(last) = self.stage_order.last() else {
            return Err(empty_error());
        };
        let target = self.target.clone().unwrap_or_else(|| last.clone());

        if !self.stages.contains_key(&target) {
            return Err(GraphValidationError::new(format!("Target stage '{target}' does not exist"))
                .with_stages(vec![target.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::UNKNOWN_TARGET, format!("Unknown target '{target}'")),
                ));
        }

        self.check_runtime_lineage(&target)?;
        if self.require_digest {
            self.check_digests()?;
        }

        Ok(StageGraph::new(self.name, target, self.stages, self.stage_order))
    }

    /// Returns the image name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn check_copies(&self, spec: &StageSpec) -> Result<(), GraphValidationError> {
        for step in &spec.steps {
            let Instruction::CopyFrom { stage, src, dest } = step else {
                continue;
            };
            let Some(producer) = self.stages.get(stage) else {
                continue;
            };

            if !producer.exposes(src) {
                return Err(GraphValidationError::new(format!(
                    "Stage '{}' copies '{}' from '{stage}', which does not declare it as an output",
                    spec.name,
                    src.display()
                ))
                .with_stages(vec![spec.name.clone(), stage.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::UNDECLARED_OUTPUT, format!("'{}' is not an output of '{stage}'", src.display()))
                        .with_context_entry("path", src.display().to_string()),
                ));
            }

            let moved = self
                .environments_of(stage, &mut HashSet::new())
                .into_iter()
                .find(|env| (env.contains(src) || env.prefix.starts_with(src)) && dest != src);
            if let Some(env) = moved {
                return Err(GraphValidationError::new(format!(
                    "Stage '{}' copies environment '{}' to '{}'; environments must keep their absolute path",
                    spec.name,
                    env.prefix.display(),
                    dest.display()
                ))
                .with_stages(vec![spec.name.clone(), stage.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::RELOCATED_ENVIRONMENT, "Environment relocated"),
                ));
            }
        }
        Ok(())
    }

    /// Environments present in `stage`: created in its base lineage or
    /// copied in from elsewhere.
    fn environments_of(&self, stage: &str, visited: &mut HashSet<String>) -> Vec<EnvironmentRecord> {
        let mut found = Vec::new();
        for name in self.lineage(stage) {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(spec) = self.stages.get(&name) else {
                continue;
            };
            found.extend(spec.declared_environments());
            for step in &spec.steps {
                if let Instruction::CopyFrom { stage: from, src, .. } = step {
                    found.extend(
                        self.environments_of(from, visited)
                            .into_iter()
                            .filter(|env| env.contains(src) || env.prefix.starts_with(src)),
                    );
                }
            }
        }
        found
    }

    /// `stage` followed by its chain of base stages.
    fn lineage(&self, stage: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(stage.to_string());
        while let Some(name) = current {
            if chain.contains(&name) {
                break;
            }
            current = self
                .stages
                .get(&name)
                .and_then(|s| s.base.stage())
                .map(str::to_string);
            chain.push(name);
        }
        chain
    }

    fn check_runtime_lineage(&self, target: &str) -> Result<(), GraphValidationError> {
        for name in self.lineage(target) {
            let Some(spec) = self.stages.get(&name) else {
                continue;
            };
            if let Some((index, step)) = spec.build_only_steps().first() {
                return Err(GraphValidationError::new(format!(
                    "Stage '{name}' step {index} ({step}) is build-only but '{name}' is part of the image built from '{target}'"
                ))
                .with_stages(vec![name.clone(), target.to_string()])
                .with_error_info(
                    ContractErrorInfo::new(codes::RUNTIME_LEAK, format!("Build-only step in runtime lineage of '{target}'"))
                        .with_context_entry("step", index.to_string()),
                ));
            }
        }
        Ok(())
    }

    fn check_digests(&self) -> Result<(), GraphValidationError> {
        for name in &self.stage_order {
            let Some(spec) = self.stages.get(name) else {
                continue;
            };
            for (index, step) in spec.steps.iter().enumerate() {
                if let Instruction::Fetch { url, sha256: None, .. } = step {
                    return Err(GraphValidationError::new(format!(
                        "Stage '{name}' step {index} fetches '{url}' without a sha256"
                    ))
                    .with_stages(vec![name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::MISSING_DIGEST, "Fetch without digest"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn empty_error() -> GraphValidationError {
    GraphValidationError::new("Declaration has no stages").with_error_info(
        ContractErrorInfo::new(codes::EMPTY, "Cannot build an empty declaration"),
    )
}

fn duplicate_error(name: &str) -> GraphValidationError {
    GraphValidationError::new(format!("Stage '{name}' is declared more than once"))
        .with_stages(vec![name.to_string()])
        .with_error_info(
            ContractErrorInfo::new(codes::DUPLICATE_STAGE, format!("Duplicate stage '{name}'")),
        )
}

fn missing_error(stage: &str, dep: &str) -> GraphValidationError {
    GraphValidationError::new(format!("Stage '{stage}' references unknown stage '{dep}'"))
        .with_stages(vec![stage.to_string(), dep.to_string()])
        .with_error_info(
            ContractErrorInfo::new(codes::MISSING_STAGE, format!("Stage '{dep}' not found")),
        )
}

/// Finds a dependency cycle, visiting roots in `order` for determinism.
pub(crate) fn find_cycle(order: &[String], deps: &HashMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for name in order {
        if !visited.contains(name) {
            if let Some(cycle) = dfs_cycle(name, deps, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    node: &str,
    deps: &HashMap<String, BTreeSet<String>>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(node_deps) = deps.get(node) {
        for dep in node_deps {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, deps, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DependencyTier;
    use crate::declaration::BaseRef;

    fn image(name: &str) -> StageSpec {
        StageSpec::new(name, BaseRef::Image("debian:slim".into()))
    }

    fn on(name: &str, base: &str) -> StageSpec {
        StageSpec::new(name, BaseRef::Stage(base.into()))
    }

    fn copy(stage: &str, src: &str, dest: &str) -> Instruction {
        Instruction::CopyFrom {
            stage: stage.into(),
            src: src.into(),
            dest: dest.into(),
        }
    }

    fn package(prefix: &str) -> Instruction {
        Instruction::Package {
            prefix: prefix.into(),
            package: "assistant".into(),
            extras: Vec::new(),
            source: None,
        }
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("test");
        assert_eq!(builder.name(), "test");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_with_dependencies() {
        let builder = PipelineBuilder::new("test")
            .stage(image("base"))
            .unwrap()
            .stage(on("builder", "base"))
            .unwrap();

        assert_eq!(builder.stage_count(), 2);
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("test").stage(on("runner", "missing")).unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_STAGE));
    }

    #[test]
    fn test_builder_duplicate() {
        let err = PipelineBuilder::new("test")
            .stage(image("base"))
            .unwrap()
            .stage(image("base"))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::DUPLICATE_STAGE));
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("test").build().unwrap_err();
        assert_eq!(err.code(), Some(codes::EMPTY));
    }

    #[test]
    fn test_copy_outside_outputs() {
        let err = PipelineBuilder::new("test")
            .stage(image("builder").with_output("/opt/venv"))
            .unwrap()
            .stage(image("runner").with_step(copy("builder", "/root/.cache", "/root/.cache")))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::UNDECLARED_OUTPUT));
    }

    #[test]
    fn test_relocated_environment() {
        let builder = PipelineBuilder::new("test")
            .stage(image("builder").with_output("/opt/venv").with_step(package("/opt/venv")))
            .unwrap();

        let err = builder
            .clone()
            .stage(image("runner").with_step(copy("builder", "/opt/venv", "/usr/local/venv")))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::RELOCATED_ENVIRONMENT));

        builder
            .stage(image("runner").with_step(copy("builder", "/opt/venv", "/opt/venv")))
            .unwrap();
    }

    #[test]
    fn test_relocation_through_intermediate_stage() {
        let err = PipelineBuilder::new("test")
            .stage(image("builder").with_output("/opt/venv").with_step(package("/opt/venv")))
            .unwrap()
            .stage(image("assembler").with_output("/opt").with_step(copy("builder", "/opt/venv", "/opt/venv")))
            .unwrap()
            .stage(image("runner").with_step(copy("assembler", "/opt", "/srv")))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::RELOCATED_ENVIRONMENT));
    }

    #[test]
    fn test_runtime_lineage_rejects_build_only() {
        let builder = PipelineBuilder::new("test")
            .stage(image("base").with_step(Instruction::Install {
                packages: vec!["build-essential".into()],
                tier: DependencyTier::BuildOnly,
            }))
            .unwrap()
            .stage(on("runner", "base"))
            .unwrap();

        let err = builder.clone().build().unwrap_err();
        assert_eq!(err.code(), Some(codes::RUNTIME_LEAK));
        assert!(err.stages.contains(&"base".to_string()));

        // Targeting the base itself is just as invalid.
        let err = builder.with_target("base").build().unwrap_err();
        assert_eq!(err.code(), Some(codes::RUNTIME_LEAK));
    }

    #[test]
    fn test_builder_stage_may_fetch() {
        let graph = PipelineBuilder::new("test")
            .stage(image("base"))
            .unwrap()
            .stage(on("builder", "base").with_output("/build").with_step(Instruction::Fetch {
                url: "https://assets.example/model.tar.gz".into(),
                dest: "/build/model.tar.gz".into(),
                sha256: None,
            }))
            .unwrap()
            .stage(on("runner", "base").with_step(copy("builder", "/build/model.tar.gz", "/app/model.tar.gz")))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(graph.target(), "runner");

        let err = PipelineBuilder::new("test")
            .stage(image("builder").with_output("/build").with_step(Instruction::Fetch {
                url: "https://assets.example/model.tar.gz".into(),
                dest: "/build/model.tar.gz".into(),
                sha256: None,
            }))
            .unwrap()
            .stage(image("runner"))
            .unwrap()
            .require_digest(true)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_DIGEST));
    }

    #[test]
    fn test_unknown_target() {
        let err = PipelineBuilder::new("test")
            .stage(image("base"))
            .unwrap()
            .with_target("nope")
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::UNKNOWN_TARGET));
    }

    #[test]
    fn test_find_cycle() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), BTreeSet::from(["c".to_string()]));
        deps.insert("b".to_string(), BTreeSet::from(["a".to_string()]));
        deps.insert("c".to_string(), BTreeSet::from(["b".to_string()]));
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        assert_eq!(find_cycle(&order, &deps).unwrap(), vec!["a", "c", "b", "a"]);

        deps.insert("a".to_string(), BTreeSet::new());
        assert!(find_cycle(&order, &deps).is_none());
    }
}
