//! Core domain model types for stagebuild.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status and role enums
//! - Dependency records with their tier
//! - Artifact, environment and fetched-asset records
//! - Build events and the instruction log

mod artifact;
mod dependency;
mod event;
mod status;

pub use artifact::{Artifact, EnvironmentRecord, FetchedAsset};
pub use dependency::{Dependency, DependencyTier};
pub use event::{BuildEvent, InstructionLog, InstructionRecord};
pub use status::{StageRole, StageStatus};
