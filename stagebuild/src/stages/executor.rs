//! Instruction execution for a single stage.

use super::{StageInputs, StageRunner, StageState, StageWorkspace};
use crate::cancellation::CancellationToken;
use crate::config::{BuildConfig, DEFAULT_SEARCH_PATH};
use crate::core::{Artifact, BuildEvent, DependencyTier, InstructionLog, StageStatus};
use crate::declaration::{BaseRef, Instruction};
use crate::errors::{BuildError, CrossStageReferenceError};
use crate::events::{self, EventSink, LoggingEventSink};
use crate::fetch::{fetch_into, ArtifactFetcher, FetchRequest, HttpFetcher};
use crate::image::{permissions, EntrypointContract, ExposedPort, UserSpec};
use crate::install::{CommandPackageManager, DependencyInstaller, PackageManager};
use crate::package::{host_references, relocate_tree, CommandPackageBuilder, EnvironmentSpec, PackageBuilder};
use crate::pipeline::StageSpec;
use crate::utils::env::{expand, rooted_search_path};
use crate::utils::fs::{copy_tree, rooted, tree_digest};
use crate::utils::process::run_command;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Variable holding the host path of the stage root in build commands.
pub const STAGE_ROOT_VAR: &str = "STAGEBUILD_ROOT";

/// The pluggable collaborators of a build.
#[derive(Clone)]
pub struct BuildServices {
    /// Installs native packages.
    pub package_manager: Arc<dyn PackageManager>,
    /// Retrieves external assets.
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Builds isolated environments.
    pub package_builder: Arc<dyn PackageBuilder>,
    /// Receives lifecycle events.
    pub sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BuildServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildServices").finish_non_exhaustive()
    }
}

impl BuildServices {
    /// Command-backed services configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &BuildConfig) -> Result<Self, BuildError> {
        Ok(Self {
            package_manager: Arc::new(CommandPackageManager::new(&config.installer)),
            fetcher: Arc::new(HttpFetcher::new(&config.fetch)?),
            package_builder: Arc::new(CommandPackageBuilder::new(&config.package_builder)),
            sink: Arc::new(LoggingEventSink::default()),
        })
    }
}

/// Runs filesystem work on a whole tree off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, BuildError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BuildError::Internal(format!("filesystem task failed: {e}")))?
        .map_err(BuildError::from)
}

/// Runs the steps of a stage inside its own workspace.
pub struct StageExecutor {
    config: Arc<BuildConfig>,
    services: BuildServices,
    installer: DependencyInstaller,
    work_dir: PathBuf,
    context_dir: PathBuf,
    log: Arc<InstructionLog>,
    token: Arc<CancellationToken>,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("work_dir", &self.work_dir)
            .field("context_dir", &self.context_dir)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor writing stage roots under `work_dir` and reading
    /// static files from `context_dir`.
    #[must_use]
    pub fn new(
        config: Arc<BuildConfig>,
        services: BuildServices,
        work_dir: impl Into<PathBuf>,
        context_dir: impl Into<PathBuf>,
    ) -> Self {
        let installer = DependencyInstaller::new(services.package_manager.clone());
        Self {
            config,
            services,
            installer,
            work_dir: work_dir.into(),
            context_dir: context_dir.into(),
            log: Arc::new(InstructionLog::new()),
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// The linear log of executed instructions.
    #[must_use]
    pub fn log(&self) -> &Arc<InstructionLog> {
        &self.log
    }

    /// The cancellation token shared by all stages of this build.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// The event sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.services.sink
    }

    async fn materialize_base(
        &self,
        spec: &StageSpec,
        ws: &StageWorkspace,
        inputs: &StageInputs,
    ) -> Result<StageState, BuildError> {
        match &spec.base {
            BaseRef::Image(name) => {
                let mut state = StageState::new(&spec.name, ws.rootfs());
                if let Some(base) = self.config.bases.get(name) {
                    if let Some(root) = &base.root {
                        let (src, dest) = (root.clone(), ws.rootfs().to_path_buf());
                        blocking(move || copy_tree(&src, &dest)).await.map_err(|e| {
                            BuildError::Config(format!("base image '{name}' at {}: {e}", root.display()))
                        })?;
                    }
                    state.env.clone_from(&base.env);
                    for package in &base.packages {
                        state.dependencies.insert(package.clone(), DependencyTier::BuildAndRun);
                    }
                } else {
                    warn!(stage = %spec.name, "Base image '{}' is not configured, starting from an empty root", name);
                }
                state
                    .env
                    .entry("PATH".to_string())
                    .or_insert_with(|| DEFAULT_SEARCH_PATH.to_string());
                Ok(state)
            }
            BaseRef::Stage(parent) => {
                let parent = inputs.get(parent).ok_or_else(|| {
                    BuildError::Internal(format!("base stage '{parent}' of '{}' has not completed", spec.name))
                })?;
                let (src, dest) = (parent.rootfs.clone(), ws.rootfs().to_path_buf());
                blocking(move || copy_tree(&src, &dest)).await?;
                Ok(parent.inherit(&spec.name, ws.rootfs()))
            }
            BaseRef::Scratch => Ok(StageState::new(&spec.name, ws.rootfs())),
        }
    }

    /// Environment for commands run on behalf of the stage.
    fn command_env(state: &StageState) -> BTreeMap<String, String> {
        let mut env = state.env.clone();
        let path = env.get("PATH").map_or(DEFAULT_SEARCH_PATH, String::as_str);
        let path = rooted_search_path(&state.rootfs, path);
        env.insert("PATH".to_string(), path);
        env.insert(STAGE_ROOT_VAR.to_string(), state.rootfs.display().to_string());
        env
    }

    fn command_dir(state: &StageState) -> PathBuf {
        state
            .workdir
            .as_deref()
            .and_then(|w| rooted(&state.rootfs, w).ok())
            .filter(|p| p.is_dir())
            .unwrap_or_else(|| state.rootfs.clone())
    }

    async fn apply(
        &self,
        spec: &StageSpec,
        index: usize,
        step: &Instruction,
        ws: &StageWorkspace,
        state: &mut StageState,
        inputs: &StageInputs,
    ) -> Result<(), BuildError> {
        let failed = |details: String| BuildError::InstructionFailed {
            stage: spec.name.clone(),
            step: index,
            instruction: step.to_string(),
            details,
        };

        match step {
            Instruction::Install { packages, tier } => {
                self.installer
                    .install(&spec.name, index, ws.rootfs(), packages, *tier, &mut state.dependencies)
                    .await?;
            }
            Instruction::Run { command } => {
                let mut argv = self.config.run.shell.clone();
                argv.push(command.clone());
                let output = run_command(&argv, &Self::command_dir(state), &Self::command_env(state))
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                if !output.success() {
                    return Err(failed(output.failure_summary()));
                }
            }
            Instruction::Fetch { url, dest, sha256 } => {
                let mut request = FetchRequest::new(url.clone(), dest.clone());
                request.sha256.clone_from(sha256);
                let asset = fetch_into(
                    self.services.fetcher.as_ref(),
                    &request,
                    ws.rootfs(),
                    &ws.staging_dir(),
                    self.config.fetch.max_size,
                )
                .await
                .map_err(|e| e.in_stage(&spec.name))?;
                state.fetched.push(asset);
            }
            Instruction::Package {
                prefix,
                package,
                extras,
                source,
            } => {
                let mut env_spec = EnvironmentSpec::new(prefix.clone(), package.clone()).with_extras(extras.clone());
                env_spec.source.clone_from(source);
                self.services
                    .package_builder
                    .build(&env_spec, ws.rootfs(), &Self::command_env(state))
                    .await
                    .map_err(|e| failed(e.to_string()))?;

                let (tree, root) = (ws.path(prefix)?, ws.rootfs().to_path_buf());
                let rewritten = blocking(move || relocate_tree(&tree, &root))
                    .await
                    .map_err(|e| failed(format!("cannot relocate {}: {e}", prefix.display())))?;
                debug!(stage = %spec.name, prefix = %prefix.display(), rewritten, "Relocated environment");
                state.add_environment(env_spec.record());
            }
            Instruction::CopyFrom { stage, src, dest } => {
                let producer = inputs.get(stage).ok_or_else(|| {
                    BuildError::Internal(format!("stage '{stage}' has not completed before '{}'", spec.name))
                })?;
                let host_src = rooted(&producer.rootfs, src)?;
                if host_src.symlink_metadata().is_err() {
                    return Err(CrossStageReferenceError::new(&spec.name, stage, src).into());
                }
                let host_dest = ws.path(dest)?;
                let environments = producer.environments_touching(src);
                let producer_root = producer.rootfs.clone();
                let check_relocation = !environments.is_empty();
                let (digest, stale) = blocking(move || {
                    copy_tree(&host_src, &host_dest)?;
                    let stale = if check_relocation {
                        host_references(&host_dest, &producer_root)?
                    } else {
                        Vec::new()
                    };
                    Ok((tree_digest(&host_dest)?, stale))
                })
                .await?;
                if let Some(path) = stale.first() {
                    return Err(failed(format!(
                        "{} still refers to the build root of stage '{stage}'",
                        path.display()
                    )));
                }
                state.artifacts.push(Artifact::new(stage, src, dest, digest));
                for env in environments {
                    state.add_environment(env);
                }
            }
            Instruction::Copy { src, dest } => {
                let host_src = rooted(&self.context_dir, src)?;
                if host_src.symlink_metadata().is_err() {
                    return Err(BuildError::Context(format!(
                        "'{}' not found in {}",
                        src.display(),
                        self.context_dir.display()
                    )));
                }
                let host_dest = ws.path(dest)?;
                blocking(move || copy_tree(&host_src, &host_dest)).await?;
            }
            Instruction::Env { key, value } => {
                let value = expand(value, &state.env);
                state.env.insert(key.clone(), value);
            }
            Instruction::Workdir { path } => {
                std::fs::create_dir_all(ws.path(path)?)?;
                state.workdir = Some(path.clone());
            }
            Instruction::Volume { path } => {
                std::fs::create_dir_all(ws.path(path)?)?;
                state.volumes.insert(path.clone());
            }
            Instruction::Expose { port, protocol } => {
                state.ports.insert(ExposedPort {
                    port: *port,
                    protocol: *protocol,
                });
            }
            Instruction::User { uid, gid } => {
                state.user = Some(UserSpec { uid: *uid, gid: *gid });
            }
            Instruction::NormalizePermissions { path } => {
                self.normalize(ws, path).await?;
                state.normalized.insert(path.clone());
            }
            Instruction::Entrypoint { exec, default_args } => {
                state.entrypoint = Some(EntrypointContract::new(exec.clone(), default_args.clone()));
            }
        }
        Ok(())
    }

    async fn normalize(&self, ws: &StageWorkspace, path: &Path) -> Result<(), BuildError> {
        let host = ws.path(path)?;
        if !host.exists() {
            return Err(BuildError::Finalization(format!(
                "cannot normalize permissions of {}: no such path",
                path.display()
            )));
        }
        let apply_ownership = self.config.finalize.apply_ownership;
        blocking(move || {
            permissions::normalize_group(&host)?;
            if apply_ownership {
                permissions::apply_group_zero(&host)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| BuildError::Finalization(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl StageRunner for StageExecutor {
    async fn run(&self, spec: &StageSpec, inputs: &StageInputs) -> Result<StageState, BuildError> {
        let ws = StageWorkspace::create(&self.work_dir, &spec.name)?;
        let mut state = self.materialize_base(spec, &ws, inputs).await?;

        for (index, step) in spec.steps.iter().enumerate() {
            if self.token.is_cancelled() {
                return Err(BuildError::Cancelled(self.token.reason().unwrap_or_default()));
            }

            let started = Instant::now();
            let result = self.apply(spec, index, step, &ws, &mut state, inputs).await;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            let status = if result.is_ok() { StageStatus::Ok } else { StageStatus::Fail };
            let record = self.log.record(&spec.name, index, step.to_string(), status, duration_ms);

            match result {
                Ok(()) => {
                    info!(stage = %spec.name, step = index, "{}", step);
                    events::emit(self.services.sink.as_ref(), &BuildEvent::step_completed(&record));
                }
                Err(e) => {
                    warn!(stage = %spec.name, step = index, error = %e, "Step failed: {}", step);
                    return Err(e);
                }
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::PortProtocol;
    use crate::events::CollectingEventSink;
    use crate::testing::{RecordingPackageManager, ScriptedPackageBuilder, StaticFetcher};
    use std::collections::HashMap;

    struct Fixture {
        _tmp: tempfile::TempDir,
        executor: StageExecutor,
        sink: Arc<CollectingEventSink>,
        context: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let context = tmp.path().join("context");
        std::fs::create_dir_all(&context).unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let services = BuildServices {
            package_manager: Arc::new(RecordingPackageManager::new()),
            fetcher: Arc::new(StaticFetcher::new().with_asset("https://assets.example/model.tar.gz", b"model")),
            package_builder: Arc::new(ScriptedPackageBuilder::new()),
            sink: sink.clone(),
        };
        let executor = StageExecutor::new(
            Arc::new(BuildConfig::default()),
            services,
            tmp.path().join("work"),
            &context,
        );
        Fixture {
            _tmp: tmp,
            executor,
            sink,
            context,
        }
    }

    #[tokio::test]
    async fn test_metadata_steps() {
        let fx = fixture();
        let spec = StageSpec::new("runner", BaseRef::Image("debian:slim".into()))
            .with_step(Instruction::Env {
                key: "PATH".into(),
                value: "/opt/venv/bin:$PATH".into(),
            })
            .with_step(Instruction::Workdir { path: "/app".into() })
            .with_step(Instruction::Volume { path: "/tmp".into() })
            .with_step(Instruction::Expose {
                port: 5005,
                protocol: PortProtocol::Tcp,
            })
            .with_step(Instruction::User { uid: 1001, gid: 0 })
            .with_step(Instruction::Entrypoint {
                exec: "assistant".into(),
                default_args: vec!["--help".into()],
            });

        let state = fx.executor.run(&spec, &HashMap::new()).await.unwrap();

        assert!(state.env["PATH"].starts_with("/opt/venv/bin:/usr/local/sbin"));
        assert_eq!(state.workdir.as_deref(), Some(Path::new("/app")));
        assert!(state.rootfs.join("app").is_dir());
        assert_eq!(state.user, Some(UserSpec { uid: 1001, gid: 0 }));
        assert_eq!(state.ports.len(), 1);
        assert_eq!(state.entrypoint.as_ref().map(EntrypointContract::executable), Some("assistant"));
        assert_eq!(fx.executor.log().len(), 6);
        assert_eq!(fx.sink.events_of_type("step.completed").len(), 6);
    }

    #[tokio::test]
    async fn test_run_sees_stage_root() {
        let fx = fixture();
        let spec = StageSpec::new("builder", BaseRef::Scratch).with_step(Instruction::Run {
            command: format!("echo built > ${STAGE_ROOT_VAR}/marker"),
        });

        let state = fx.executor.run(&spec, &HashMap::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(state.rootfs.join("marker")).unwrap(), "built\n");
    }

    #[tokio::test]
    async fn test_failed_run_is_logged() {
        let fx = fixture();
        let spec = StageSpec::new("builder", BaseRef::Scratch)
            .with_step(Instruction::Run { command: "exit 0".into() })
            .with_step(Instruction::Run { command: "exit 7".into() })
            .with_step(Instruction::Run { command: "exit 0".into() });

        let err = fx.executor.run(&spec, &HashMap::new()).await.unwrap_err();
        match err {
            BuildError::InstructionFailed { stage, step, .. } => {
                assert_eq!(stage, "builder");
                assert_eq!(step, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        let failure = fx.executor.log().first_failure().unwrap();
        assert_eq!((failure.stage.as_str(), failure.step), ("builder", 1));
        assert_eq!(fx.executor.log().len(), 2);
    }

    #[tokio::test]
    async fn test_copy_from_missing_path() {
        let fx = fixture();
        let builder = fx
            .executor
            .run(&StageSpec::new("builder", BaseRef::Scratch).with_output("/opt/venv"), &HashMap::new())
            .await
            .unwrap();

        let mut inputs = HashMap::new();
        inputs.insert("builder".to_string(), Arc::new(builder));
        let runner = StageSpec::new("runner", BaseRef::Scratch).with_step(Instruction::CopyFrom {
            stage: "builder".into(),
            src: "/opt/venv".into(),
            dest: "/opt/venv".into(),
        });

        let err = fx.executor.run(&runner, &inputs).await.unwrap_err();
        assert!(matches!(err, BuildError::CrossStageReference(_)));
    }

    #[tokio::test]
    async fn test_package_then_copy_carries_environment() {
        let fx = fixture();
        let builder_spec = StageSpec::new("builder", BaseRef::Scratch)
            .with_output("/opt/venv")
            .with_step(Instruction::Package {
                prefix: "/opt/venv".into(),
                package: "assistant".into(),
                extras: vec!["full".into()],
                source: None,
            });
        let builder = fx.executor.run(&builder_spec, &HashMap::new()).await.unwrap();
        assert_eq!(builder.environments.len(), 1);

        let mut inputs = HashMap::new();
        inputs.insert("builder".to_string(), Arc::new(builder));
        let runner_spec = StageSpec::new("runner", BaseRef::Scratch).with_step(Instruction::CopyFrom {
            stage: "builder".into(),
            src: "/opt/venv".into(),
            dest: "/opt/venv".into(),
        });
        let runner = fx.executor.run(&runner_spec, &inputs).await.unwrap();

        assert_eq!(runner.environments.len(), 1);
        assert_eq!(runner.artifacts[0].producer, "builder");
        assert!(runner.rootfs.join("opt/venv/bin/assistant").is_file());
    }

    #[tokio::test]
    async fn test_copy_from_context_and_fetch() {
        let fx = fixture();
        std::fs::write(fx.context.join("config.yml"), b"language: en\n").unwrap();
        let spec = StageSpec::new("builder", BaseRef::Scratch)
            .with_step(Instruction::Copy {
                src: "config.yml".into(),
                dest: "/app/config.yml".into(),
            })
            .with_step(Instruction::Fetch {
                url: "https://assets.example/model.tar.gz".into(),
                dest: "/build/model.tar.gz".into(),
                sha256: None,
            });

        let state = fx.executor.run(&spec, &HashMap::new()).await.unwrap();
        assert!(state.rootfs.join("app/config.yml").is_file());
        assert_eq!(state.fetched[0].size, 5);

        let missing = StageSpec::new("other", BaseRef::Scratch).with_step(Instruction::Copy {
            src: "nope.yml".into(),
            dest: "/app/nope.yml".into(),
        });
        assert!(matches!(
            fx.executor.run(&missing, &HashMap::new()).await,
            Err(BuildError::Context(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let fx = fixture();
        fx.executor.token().cancel("stage 'other' failed");
        let spec = StageSpec::new("builder", BaseRef::Scratch).with_step(Instruction::Run { command: "true".into() });

        let err = fx.executor.run(&spec, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, BuildError::Cancelled(reason) if reason.contains("other")));
        assert!(fx.executor.log().is_empty());
    }
}
