//! Local launching of finalized images.
//!
//! The image root is not a chroot: executables are resolved through the
//! image search path mapped into the root, and the process runs on the host
//! with the image environment. Ownership is not switched; the uid/gid in
//! the runtime config are informational here. Scripts whose `#!`
//! interpreter lives in the image are started through that interpreter.

use super::{EntrypointContract, Image, RuntimeConfig};
use crate::errors::BuildError;
use crate::stages::STAGE_ROOT_VAR;
use crate::utils::env::rooted_search_path;
use crate::utils::fs::rooted;
use crate::utils::process::{run_command, CommandOutput};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// A fully resolved launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Host path of the executable.
    pub program: PathBuf,
    /// Arguments after entrypoint resolution.
    pub args: Vec<String>,
    /// Process environment.
    pub env: BTreeMap<String, String>,
    /// Host working directory.
    pub cwd: PathBuf,
}

/// Starts the entrypoint of an image.
#[derive(Debug, Clone)]
pub struct Launcher {
    rootfs: PathBuf,
    runtime: RuntimeConfig,
    entrypoint: EntrypointContract,
}

impl Launcher {
    /// Creates a launcher for `image`.
    #[must_use]
    pub fn new(image: &Image) -> Self {
        Self {
            rootfs: image.rootfs(),
            runtime: image.runtime().clone(),
            entrypoint: image.entrypoint().clone(),
        }
    }

    /// Finds the entrypoint executable inside the image root.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no search path entry holds an
    /// executable file of that name.
    pub fn resolve_executable(&self) -> Result<PathBuf, BuildError> {
        let exe = self.entrypoint.executable();

        let candidates: Vec<PathBuf> = if exe.starts_with('/') {
            vec![rooted(&self.rootfs, Path::new(exe))?]
        } else if exe.contains('/') {
            vec![rooted(&self.rootfs, &self.runtime.workdir().join(exe))?]
        } else {
            self.runtime
                .search_path()
                .iter()
                .filter_map(|dir| rooted(&self.rootfs, Path::new(dir)).ok())
                .map(|dir| dir.join(exe))
                .collect()
        };

        candidates
            .into_iter()
            .find(|path| is_executable(path))
            .ok_or_else(|| {
                BuildError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("entrypoint '{exe}' not found on the image search path"),
                ))
            })
    }

    /// The image-local `#!` interpreter of `script` and its optional
    /// argument, when the interpreter exists inside the image.
    fn interpreter(&self, script: &Path) -> Option<(PathBuf, Option<String>)> {
        let mut head = [0u8; 512];
        let n = fs::File::open(script).and_then(|mut f| f.read(&mut head)).ok()?;
        let text = String::from_utf8_lossy(&head[..n]);
        let line = text.strip_prefix("#!")?.lines().next()?;

        let mut parts = line.split_whitespace();
        let interpreter = parts.next().filter(|p| p.starts_with('/'))?;
        let host = rooted(&self.rootfs, Path::new(interpreter))
            .ok()
            .filter(|p| is_executable(p))?;
        let arg = parts.collect::<Vec<_>>().join(" ");
        Some((host, (!arg.is_empty()).then_some(arg)))
    }

    /// Resolves the full launch for `args`.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be resolved.
    pub fn command(&self, args: &[String]) -> Result<LaunchCommand, BuildError> {
        let script = self.resolve_executable()?;
        let resolved = self.entrypoint.resolve(args);
        let (program, args) = match self.interpreter(&script) {
            Some((interpreter, arg)) => {
                let args = arg
                    .into_iter()
                    .chain(std::iter::once(script.display().to_string()))
                    .chain(resolved)
                    .collect();
                (interpreter, args)
            }
            None => (script, resolved),
        };

        let mut env = self.runtime.env().clone();
        let search_path = self.runtime.search_path().join(":");
        env.insert("PATH".to_string(), rooted_search_path(&self.rootfs, &search_path));
        env.insert(STAGE_ROOT_VAR.to_string(), self.rootfs.display().to_string());

        let cwd = rooted(&self.rootfs, self.runtime.workdir())
            .ok()
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(|| self.rootfs.clone());

        Ok(LaunchCommand { program, args, env, cwd })
    }

    /// Runs the entrypoint to completion, capturing its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub async fn output(&self, args: &[String]) -> Result<CommandOutput, BuildError> {
        let launch = self.command(args)?;
        let argv: Vec<String> = std::iter::once(launch.program.display().to_string())
            .chain(launch.args)
            .collect();
        Ok(run_command(&argv, &launch.cwd, &launch.env).await?)
    }

    /// Runs the entrypoint attached to the current terminal and returns its
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub async fn run(&self, args: &[String]) -> Result<i32, BuildError> {
        let launch = self.command(args)?;
        info!(program = %launch.program.display(), args = ?launch.args, "Launching image entrypoint");

        let status = tokio::process::Command::new(&launch.program)
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .env_clear()
            .envs(&launch.env)
            .status()
            .await?;

        Ok(status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(1))
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
