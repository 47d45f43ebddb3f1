//! Native dependency records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// When a native dependency is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyTier {
    /// Compilers, headers, fetch clients. Never part of the image.
    BuildOnly,
    /// Libraries linked at build time and loaded at run time.
    BuildAndRun,
}

impl Default for DependencyTier {
    fn default() -> Self {
        Self::BuildOnly
    }
}

impl fmt::Display for DependencyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildOnly => write!(f, "build_only"),
            Self::BuildAndRun => write!(f, "build_and_run"),
        }
    }
}

/// A named system package with its tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    /// Package name as understood by the package manager.
    pub name: String,
    /// Build-only or build-and-run.
    pub tier: DependencyTier,
}

impl Dependency {
    /// Creates a new dependency.
    #[must_use]
    pub fn new(name: impl Into<String>, tier: DependencyTier) -> Self {
        Self {
            name: name.into(),
            tier,
        }
    }

    /// Creates a build-only dependency.
    #[must_use]
    pub fn build_only(name: impl Into<String>) -> Self {
        Self::new(name, DependencyTier::BuildOnly)
    }

    /// Creates a build-and-run dependency.
    #[must_use]
    pub fn build_and_run(name: impl Into<String>) -> Self {
        Self::new(name, DependencyTier::BuildAndRun)
    }

    /// Returns true if the dependency may be present at run time.
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        self.tier == DependencyTier::BuildAndRun
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_tiers() {
        assert!(Dependency::build_and_run("libpq-dev").is_runtime());
        assert!(!Dependency::build_only("build-essential").is_runtime());
        assert_eq!(DependencyTier::default(), DependencyTier::BuildOnly);
    }

    #[test]
    fn test_tier_serialize() {
        let json = serde_json::to_string(&DependencyTier::BuildAndRun).unwrap();
        assert_eq!(json, r#""build_and_run""#);
    }
}
