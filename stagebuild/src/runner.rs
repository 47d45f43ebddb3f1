//! End-to-end build orchestration.
//!
//! Validates a declaration, runs the stage graph and finalizes the target
//! stage into an image. Stage roots live in a per-build work directory that
//! is removed when the build ends, successful or not.

use crate::config::BuildConfig;
use crate::core::{BuildEvent, InstructionRecord};
use crate::declaration::BuildDeclaration;
use crate::errors::BuildError;
use crate::events::{emit, EventSink};
use crate::image::{Image, ImageFinalizer};
use crate::pipeline::{ExecutionPlan, PipelineBuilder, StageGraph};
use crate::stages::{BuildServices, StageExecutor};
use crate::utils::fs::remove_tree;
use crate::utils::generate_uuid;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// The published image.
    pub image: Image,
    /// Every executed instruction, in completion order.
    pub instructions: Vec<InstructionRecord>,
    /// Stages that ran, in execution order.
    pub stages: Vec<String>,
    /// Total wall time in milliseconds.
    pub duration_ms: f64,
}

/// Runs builds with one configuration.
pub struct BuildRunner {
    config: Arc<BuildConfig>,
    services: Option<BuildServices>,
    sink: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for BuildRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BuildRunner {
    /// Creates a runner using command-backed services.
    #[must_use]
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config: Arc::new(config),
            services: None,
            sink: None,
        }
    }

    /// Replaces the build services.
    #[must_use]
    pub fn with_services(mut self, services: BuildServices) -> Self {
        self.services = Some(services);
        self
    }

    /// Replaces the event sink of the services.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Statically validates `declaration` into a stage graph.
    ///
    /// # Errors
    ///
    /// Returns a graph validation error; nothing is executed.
    pub fn validate(&self, declaration: &BuildDeclaration) -> Result<StageGraph, BuildError> {
        Ok(PipelineBuilder::from_declaration(declaration, &self.config)?.build()?)
    }

    /// Validates `declaration` and returns its execution plan.
    ///
    /// # Errors
    ///
    /// Returns a graph validation error.
    pub fn plan(&self, declaration: &BuildDeclaration) -> Result<ExecutionPlan, BuildError> {
        Ok(self.validate(declaration)?.plan())
    }

    /// Builds `declaration` and publishes the image.
    ///
    /// # Errors
    ///
    /// Returns the first error of the build; no image is published.
    pub async fn build(&self, declaration: &BuildDeclaration) -> Result<BuildReport, BuildError> {
        let start = Instant::now();
        let graph = self.validate(declaration)?;

        let mut services = match &self.services {
            Some(services) => services.clone(),
            None => BuildServices::from_config(&self.config)?,
        };
        if let Some(sink) = &self.sink {
            services.sink = Arc::clone(sink);
        }
        let sink = Arc::clone(&services.sink);

        let work_dir = self.config.work_dir.join(format!("build-{}", generate_uuid()));
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&self.config),
            services,
            &work_dir,
            declaration.context_dir(),
        ));

        info!(image = %graph.name(), target = %graph.target(), work_dir = %work_dir.display(), "Build started");
        emit(
            sink.as_ref(),
            &BuildEvent::new("build.started")
                .add_data("image", serde_json::json!(graph.name()))
                .add_data("target", serde_json::json!(graph.target()))
                .add_data("stages", serde_json::json!(graph.execution_order())),
        );

        let result = self.execute(&graph, &executor, &sink).await;
        remove_work_dir(&work_dir).await;

        match result {
            Ok(image) => {
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                emit(
                    sink.as_ref(),
                    &BuildEvent::new("image.finalized")
                        .add_data("image", serde_json::json!(image.config().name))
                        .add_data("id", serde_json::json!(image.id()))
                        .add_data("dir", serde_json::json!(image.dir().display().to_string()))
                        .add_data("duration_ms", serde_json::json!(duration_ms)),
                );
                Ok(BuildReport {
                    image,
                    instructions: executor.log().records(),
                    stages: graph.execution_order().to_vec(),
                    duration_ms,
                })
            }
            Err(err) => {
                error!(image = %graph.name(), error = %err, "Build failed");
                emit(
                    sink.as_ref(),
                    &BuildEvent::new("build.failed")
                        .add_data("image", serde_json::json!(graph.name()))
                        .add_data("error", serde_json::json!(err.to_string()))
                        .add_data("kind", serde_json::json!(err.kind()))
                        .add_data("stage", serde_json::json!(err.stage())),
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        graph: &StageGraph,
        executor: &Arc<StageExecutor>,
        sink: &Arc<dyn EventSink>,
    ) -> Result<Image, BuildError> {
        let result = graph
            .execute(
                Arc::clone(executor) as Arc<dyn crate::stages::StageRunner>,
                Arc::clone(executor.token()),
                Arc::clone(sink),
                self.config.max_parallel_stages,
            )
            .await?;

        let target = result
            .target_stage()
            .ok_or_else(|| BuildError::Internal(format!("target stage '{}' did not run", graph.target())))?;

        ImageFinalizer::new(self.config.finalize.clone(), &self.config.output_dir)
            .finalize(graph.name(), target)
            .await
    }
}

async fn remove_work_dir(dir: &Path) {
    let owned = dir.to_path_buf();
    let result = tokio::task::spawn_blocking(move || remove_tree(&owned))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e)));
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove build work directory");
        }
    }
}
