//! Stage graph building and execution.
//!
//! This module provides:
//! - Stage specifications
//! - A graph builder with static validation
//! - The DAG execution engine

mod builder;
mod dag;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use dag::{ExecutionPlan, GraphExecutionResult, StageGraph};
pub use spec::StageSpec;
