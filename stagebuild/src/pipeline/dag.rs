//! StageGraph DAG execution engine.
//!
//! Executes stages as soon as their dependencies are met, bounded by a
//! semaphore. Only stages the target needs are run.

use super::StageSpec;
use crate::cancellation::CancellationToken;
use crate::core::{BuildEvent, StageRole};
use crate::errors::BuildError;
use crate::events::{emit, EventSink};
use crate::stages::{StageInputs, StageRunner, StageState};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Result of executing a stage graph.
#[derive(Debug)]
pub struct GraphExecutionResult {
    /// Final states of every executed stage.
    pub stages: HashMap<String, Arc<StageState>>,
    /// Total execution time in milliseconds.
    pub duration_ms: f64,
    /// The target stage name.
    pub target: String,
}

impl GraphExecutionResult {
    /// Returns the final state of the target stage.
    #[must_use]
    pub fn target_stage(&self) -> Option<&Arc<StageState>> {
        self.stages.get(&self.target)
    }
}

/// What a build would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The image name.
    pub name: String,
    /// The target stage.
    pub target: String,
    /// Groups of stages that may run concurrently, in order.
    pub waves: Vec<Vec<String>>,
    /// Role of every declared stage.
    pub roles: BTreeMap<String, StageRole>,
}

/// A directed acyclic graph of stages for execution.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// The image name.
    name: String,
    /// The stage whose filesystem becomes the image.
    target: String,
    /// Stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Declaration order.
    stage_order: Vec<String>,
    /// Topological order of the stages the target needs.
    execution_order: Vec<String>,
}

impl StageGraph {
    /// Creates a new stage graph. The graph must already be validated.
    #[must_use]
    pub fn new(
        name: String,
        target: String,
        stages: HashMap<String, StageSpec>,
        stage_order: Vec<String>,
    ) -> Self {
        let needed = closure(&stages, &target);
        let execution_order = topological_sort(&stages, &stage_order)
            .into_iter()
            .filter(|name| needed.contains(name))
            .collect();

        Self {
            name,
            target,
            stages,
            stage_order,
            execution_order,
        }
    }

    /// Returns the image name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the target stage name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the number of declared stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns a stage specification by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Returns stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stage_order.iter().filter_map(|name| self.stages.get(name))
    }

    /// Returns the execution order of the stages the target needs.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns `stage` followed by its chain of base stages.
    #[must_use]
    pub fn lineage(&self, stage: &str) -> Vec<String> {
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

    /// Classifies every stage relative to the target.
    #[must_use]
    pub fn roles(&self) -> BTreeMap<String, StageRole> {
        let lineage: HashSet<String> = self.lineage(&self.target).into_iter().collect();
        let needed: HashSet<&String> = self.execution_order.iter().collect();

        self.stage_order
            .iter()
            .map(|name| {
                let role = if *name == self.target {
                    StageRole::Runtime
                } else if lineage.contains(name) {
                    StageRole::Shared
                } else if needed.contains(name) {
                    StageRole::Build
                } else {
                    StageRole::Unused
                };
                (name.clone(), role)
            })
            .collect()
    }

    /// Groups the needed stages into waves of mutually independent stages.
    #[must_use]
    pub fn plan(&self) -> ExecutionPlan {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        for name in &self.execution_order {
            let level = self
                .stages
                .get(name)
                .map(|spec| {
                    spec.dependencies()
                        .iter()
                        .filter_map(|dep| levels.get(dep.as_str()))
                        .map(|l| l + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            levels.insert(name.as_str(), level);
            if waves.len() <= level {
                waves.resize(level + 1, Vec::new());
            }
            waves[level].push(name.clone());
        }

        ExecutionPlan {
            name: self.name.clone(),
            target: self.target.clone(),
            waves,
            roles: self.roles(),
        }
    }

    /// Executes the needed stages with bounded parallelism.
    ///
    /// A stage starts as soon as every stage it depends on has completed.
    /// The first failure trips `token`, aborts the stages still running and
    /// is returned.
    pub async fn execute(
        &self,
        runner: Arc<dyn StageRunner>,
        token: Arc<CancellationToken>,
        sink: Arc<dyn EventSink>,
        max_parallel: usize,
    ) -> Result<GraphExecutionResult, BuildError> {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let total_stages = self.execution_order.len();

        // Track in-degree (number of unsatisfied dependencies) for each stage
        let mut in_degree: HashMap<&str, usize> = self
            .execution_order
            .iter()
            .map(|name| {
                let count = self.stages.get(name).map_or(0, |s| s.dependencies().len());
                (name.as_str(), count)
            })
            .collect();

        let mut completed: HashMap<String, Arc<StageState>> = HashMap::new();
        let mut active: FuturesUnordered<tokio::task::JoinHandle<StageTaskResult>> = FuturesUnordered::new();

        for name in &self.execution_order {
            if in_degree.get(name.as_str()) == Some(&0) {
                active.push(self.spawn_stage_task(name, &completed, &runner, &semaphore, &sink)?);
            }
        }

        info!(
            image = %self.name,
            target = %self.target,
            stages = total_stages,
            max_parallel,
            "Executing stage graph"
        );

        while completed.len() < total_stages {
            if token.is_cancelled() {
                abort_all(&mut active).await;
                return Err(BuildError::Cancelled(
                    token.reason().unwrap_or_else(|| "cancelled".to_string()),
                ));
            }

            if active.is_empty() {
                let pending: Vec<&String> = self
                    .execution_order
                    .iter()
                    .filter(|name| !completed.contains_key(*name))
                    .collect();
                return Err(BuildError::Internal(format!(
                    "Deadlocked stage graph; remaining stages: {pending:?}"
                )));
            }

            let Some(joined) = active.next().await else {
                continue;
            };

            match joined {
                Ok((stage_name, Ok(state), duration_ms)) => {
                    emit(sink.as_ref(), &BuildEvent::stage_completed(&stage_name, duration_ms));
                    debug!(stage = %stage_name, duration_ms, "Stage completed");
                    completed.insert(stage_name.clone(), Arc::new(state));

                    for child in &self.execution_order {
                        let depends = self
                            .stages
                            .get(child)
                            .is_some_and(|spec| spec.dependencies().contains(&stage_name));
                        if !depends {
                            continue;
                        }
                        if let Some(count) = in_degree.get_mut(child.as_str()) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && !completed.contains_key(child) {
                                active.push(self.spawn_stage_task(child, &completed, &runner, &semaphore, &sink)?);
                            }
                        }
                    }
                }
                Ok((stage_name, Err(error), _)) => {
                    emit(sink.as_ref(), &BuildEvent::stage_failed(&stage_name, &error.to_string()));
                    warn!(stage = %stage_name, error = %error, "Stage failed");
                    token.cancel(format!("stage '{stage_name}' failed: {error}"));
                    abort_all(&mut active).await;
                    return Err(error);
                }
                Err(join_error) => {
                    token.cancel(format!("stage task failed: {join_error}"));
                    abort_all(&mut active).await;
                    return Err(BuildError::Internal(format!("Task join error: {join_error}")));
                }
            }
        }

        Ok(GraphExecutionResult {
            stages: completed,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            target: self.target.clone(),
        })
    }

    /// Spawns a task to execute a single stage.
    fn spawn_stage_task(
        &self,
        stage_name: &str,
        completed: &HashMap<String, Arc<StageState>>,
        runner: &Arc<dyn StageRunner>,
        semaphore: &Arc<Semaphore>,
        sink: &Arc<dyn EventSink>,
    ) -> Result<tokio::task::JoinHandle<StageTaskResult>, BuildError> {
        let spec = self
            .stages
            .get(stage_name)
            .cloned()
            .ok_or_else(|| BuildError::Internal(format!("Unknown stage '{stage_name}'")))?;

        let inputs: StageInputs = spec
            .dependencies()
            .into_iter()
            .filter_map(|dep| completed.get(&dep).map(|state| (dep, Arc::clone(state))))
            .collect();

        let runner = Arc::clone(runner);
        let semaphore = Arc::clone(semaphore);
        let sink = Arc::clone(sink);
        let stage_name = stage_name.to_string();

        Ok(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    return (stage_name, Err(BuildError::Internal(format!("Semaphore closed: {e}"))), 0.0);
                }
            };

            emit(sink.as_ref(), &BuildEvent::stage_started(&stage_name));
            let stage_start = Instant::now();

            let result = runner.run(&spec, &inputs).await;
            (stage_name, result, stage_start.elapsed().as_secs_f64() * 1000.0)
        }))
    }
}

type StageTaskResult = (String, Result<StageState, BuildError>, f64);

/// Aborts every running stage and waits for the tasks to unwind, so child
/// processes are reaped before the error is reported.
async fn abort_all(active: &mut FuturesUnordered<tokio::task::JoinHandle<StageTaskResult>>) {
    for handle in active.iter() {
        handle.abort();
    }
    while active.next().await.is_some() {}
}

/// Stages reachable from `target` through dependencies, including itself.
fn closure(stages: &HashMap<String, StageSpec>, target: &str) -> BTreeSet<String> {
    let mut needed = BTreeSet::new();
    let mut queue = vec![target.to_string()];
    while let Some(name) = queue.pop() {
        if !needed.insert(name.clone()) {
            continue;
        }
        if let Some(spec) = stages.get(&name) {
            queue.extend(spec.dependencies());
        }
    }
    needed
}

/// Performs topological sort on the stage graph.
fn topological_sort(stages: &HashMap<String, StageSpec>, stage_order: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut temp_visited = HashSet::new();

    fn visit(
        node: &str,
        stages: &HashMap<String, StageSpec>,
        visited: &mut HashSet<String>,
        temp_visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node) || temp_visited.contains(node) {
            return;
        }

        temp_visited.insert(node.to_string());

        if let Some(spec) = stages.get(node) {
            for dep in spec.dependencies() {
                visit(&dep, stages, visited, temp_visited, result);
            }
        }

        temp_visited.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    // Visit in declaration order for determinism
    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }

    result
}
