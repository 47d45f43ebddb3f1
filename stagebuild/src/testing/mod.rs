//! Test doubles for the build services.
//!
//! This module provides:
//! - A recording package manager that writes marker files
//! - Static and unreachable artifact fetchers
//! - A scripted package builder that creates runnable entrypoints

mod mocks;

pub use mocks::{
    RecordingPackageManager, ScriptedPackageBuilder, StaticFetcher, UnreachableFetcher, INSTALLED_MARKER_DIR,
};
