//! # Stagebuild
//!
//! A multi-stage image build pipeline.
//!
//! Stagebuild assembles a runnable service image from named stages:
//!
//! - **Stage graph**: stages build on each other or copy declared outputs
//!   out of each other; the graph is validated before anything runs
//! - **Dependency installer**: native packages tagged build-only or
//!   build-and-run
//! - **Artifact fetcher**: external assets downloaded once, in a builder
//!   stage, and placed atomically
//! - **Package builder**: isolated environments at a fixed absolute prefix
//! - **Image finalizer**: non-root identity, group-accessible files, an
//!   exported layer and an immutable runtime config
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagebuild::prelude::*;
//!
//! let declaration = BuildDeclaration::load(Path::new("stagebuild.toml"))?;
//! let runner = BuildRunner::new(BuildConfig::default());
//!
//! let report = runner.build(&declaration).await?;
//! println!("{}", report.image.id());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod declaration;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod image;
pub mod install;
pub mod package;
pub mod pipeline;
pub mod runner;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BaseImageConfig, BuildConfig};
    pub use crate::core::{
        Artifact, BuildEvent, Dependency, DependencyTier, EnvironmentRecord, StageRole, StageStatus,
    };
    pub use crate::declaration::{BaseRef, BuildDeclaration, Instruction, StageDeclaration};
    pub use crate::errors::{
        BuildError, ContractErrorInfo, CycleDetectedError, ErrorKind, FetchError, GraphValidationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::image::{EntrypointContract, Image, ImageFinalizer, Launcher, RuntimeConfig};
    pub use crate::pipeline::{ExecutionPlan, PipelineBuilder, StageGraph, StageSpec};
    pub use crate::runner::{BuildReport, BuildRunner};
    pub use crate::stages::{BuildServices, StageExecutor, StageRunner};
}

/// Version of the stagebuild crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
