//! Stage execution.
//!
//! A stage runs its instructions in order inside its own workspace. It
//! starts from its base (an external image, a completed stage, or nothing)
//! and can read other stages only through `copy_from`.

mod executor;
mod state;
mod workspace;

pub use executor::{BuildServices, StageExecutor, STAGE_ROOT_VAR};
pub use state::StageState;
pub use workspace::StageWorkspace;

use crate::errors::BuildError;
use crate::pipeline::StageSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Completed states of the stages a stage depends on, by name.
pub type StageInputs = HashMap<String, Arc<StageState>>;

/// Executes one stage once all of its dependencies have completed.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runs `spec` with the completed states of its dependencies.
    async fn run(&self, spec: &StageSpec, inputs: &StageInputs) -> Result<StageState, BuildError>;
}
