//! Build instructions.

use crate::core::DependencyTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP (default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A single step of a stage, executed in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// Install native packages with the package manager.
    Install {
        /// Package names.
        packages: Vec<String>,
        /// Build-only or build-and-run.
        #[serde(default)]
        tier: DependencyTier,
    },
    /// Run an arbitrary build command through the configured shell.
    Run {
        /// The command line.
        command: String,
    },
    /// Retrieve an external binary asset.
    Fetch {
        /// Stable external locator (`https://`, `http://` or `file://`).
        url: String,
        /// Absolute destination path inside the stage.
        dest: PathBuf,
        /// Expected SHA-256 of the content, hex encoded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    /// Install the application and extras into an isolated environment.
    Package {
        /// Absolute install prefix.
        prefix: PathBuf,
        /// Application name.
        package: String,
        /// Optional feature extras.
        #[serde(default)]
        extras: Vec<String>,
        /// Install from this path inside the stage instead of by name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
    },
    /// Copy a named artifact out of another completed stage.
    CopyFrom {
        /// Producing stage.
        stage: String,
        /// Absolute path inside the producer.
        src: PathBuf,
        /// Absolute path inside this stage.
        dest: PathBuf,
    },
    /// Copy a static file from the build context.
    Copy {
        /// Path relative to the build context.
        src: PathBuf,
        /// Absolute path inside this stage.
        dest: PathBuf,
    },
    /// Set an environment variable. `$VAR` and `${VAR}` are expanded.
    Env {
        /// Variable name.
        key: String,
        /// Value, expanded against the current environment.
        value: String,
    },
    /// Set the working directory.
    Workdir {
        /// Absolute path.
        path: PathBuf,
    },
    /// Declare an ephemeral volume mount point.
    Volume {
        /// Absolute path.
        path: PathBuf,
    },
    /// Declare an exposed network port.
    Expose {
        /// Port number.
        port: u16,
        /// Protocol.
        #[serde(default)]
        protocol: PortProtocol,
    },
    /// Set the execution identity.
    User {
        /// Numeric user id.
        uid: u32,
        /// Numeric group id.
        #[serde(default)]
        gid: u32,
    },
    /// Give the group every permission the owner has, recursively.
    NormalizePermissions {
        /// Absolute path of the tree.
        path: PathBuf,
    },
    /// Set the entrypoint executable and its default arguments.
    Entrypoint {
        /// Executable name or absolute path.
        exec: String,
        /// Arguments used when none are supplied at launch.
        #[serde(default)]
        default_args: Vec<String>,
    },
}

impl Instruction {
    /// Short uppercase name of the instruction.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Install { .. } => "INSTALL",
            Self::Run { .. } => "RUN",
            Self::Fetch { .. } => "FETCH",
            Self::Package { .. } => "PACKAGE",
            Self::CopyFrom { .. } | Self::Copy { .. } => "COPY",
            Self::Env { .. } => "ENV",
            Self::Workdir { .. } => "WORKDIR",
            Self::Volume { .. } => "VOLUME",
            Self::Expose { .. } => "EXPOSE",
            Self::User { .. } => "USER",
            Self::NormalizePermissions { .. } => "NORMALIZE",
            Self::Entrypoint { .. } => "ENTRYPOINT",
        }
    }

    /// Returns the stage this instruction copies from, if any.
    #[must_use]
    pub fn copy_source(&self) -> Option<&str> {
        match self {
            Self::CopyFrom { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Checks the instruction's own arguments.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Install { packages, .. } => {
                if packages.is_empty() || packages.iter().any(|p| p.trim().is_empty()) {
                    return Err("install needs at least one non-empty package name".into());
                }
            }
            Self::Run { command } => {
                if command.trim().is_empty() {
                    return Err("run needs a command".into());
                }
            }
            Self::Fetch { url, dest, sha256 } => {
                if !url.contains("://") {
                    return Err(format!("fetch locator '{url}' has no scheme"));
                }
                require_absolute("fetch dest", dest)?;
                if let Some(digest) = sha256 {
                    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(format!("fetch sha256 '{digest}' is not 64 hex characters"));
                    }
                }
            }
            Self::Package { prefix, package, .. } => {
                require_absolute("package prefix", prefix)?;
                if package.trim().is_empty() {
                    return Err("package needs a name".into());
                }
            }
            Self::CopyFrom { src, dest, .. } => {
                require_absolute("copy_from src", src)?;
                require_absolute("copy_from dest", dest)?;
            }
            Self::Copy { src, dest } => {
                if src.is_absolute() {
                    return Err("copy src must be relative to the build context".into());
                }
                require_absolute("copy dest", dest)?;
            }
            Self::Env { key, .. } => {
                if key.is_empty() || key.contains('=') {
                    return Err(format!("invalid environment variable name '{key}'"));
                }
            }
            Self::Workdir { path } => require_absolute("workdir", path)?,
            Self::Volume { path } => require_absolute("volume", path)?,
            Self::NormalizePermissions { path } => require_absolute("normalize_permissions path", path)?,
            Self::Expose { port, .. } => {
                if *port == 0 {
                    return Err("expose needs a non-zero port".into());
                }
            }
            Self::Entrypoint { exec, .. } => {
                if exec.trim().is_empty() {
                    return Err("entrypoint needs an executable".into());
                }
            }
            Self::User { .. } => {}
        }
        Ok(())
    }
}

fn require_absolute(what: &str, path: &Path) -> Result<(), String> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(format!("{what} must be absolute, got '{}'", path.display()))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install { packages, tier } => write!(f, "INSTALL [{tier}] {}", packages.join(" ")),
            Self::Run { command } => write!(f, "RUN {command}"),
            Self::Fetch { url, dest, .. } => write!(f, "FETCH {url} {}", dest.display()),
            Self::Package { prefix, package, extras, .. } => {
                if extras.is_empty() {
                    write!(f, "PACKAGE {package} {}", prefix.display())
                } else {
                    write!(f, "PACKAGE {package}[{}] {}", extras.join(","), prefix.display())
                }
            }
            Self::CopyFrom { stage, src, dest } => {
                write!(f, "COPY --from={stage} {} {}", src.display(), dest.display())
            }
            Self::Copy { src, dest } => write!(f, "COPY {} {}", src.display(), dest.display()),
            Self::Env { key, value } => write!(f, "ENV {key}={value}"),
            Self::Workdir { path } => write!(f, "WORKDIR {}", path.display()),
            Self::Volume { path } => write!(f, "VOLUME {}", path.display()),
            Self::Expose { port, protocol } => write!(f, "EXPOSE {port}/{protocol}"),
            Self::User { uid, gid } => write!(f, "USER {uid}:{gid}"),
            Self::NormalizePermissions { path } => write!(f, "NORMALIZE g=u {}", path.display()),
            Self::Entrypoint { exec, default_args } => {
                write!(f, "ENTRYPOINT [{exec:?}] CMD {default_args:?}")
            }
        }
    }
}
