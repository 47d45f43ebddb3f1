//! Child process execution for build commands.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// One-line failure summary with the tail of stderr.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let tail: Vec<&str> = self.stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        if tail.is_empty() {
            format!("exit status {}", self.exit_code)
        } else {
            format!("exit status {}: {}", self.exit_code, tail.join(" | "))
        }
    }
}

/// Runs `argv` to completion in `cwd` with exactly `env` as its environment.
///
/// # Errors
///
/// Returns an error if the argument vector is empty or the program cannot
/// be spawned. A nonzero exit is not an error here; check
/// [`CommandOutput::success`].
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> std::io::Result<CommandOutput> {
    let start = Instant::now();
    let (exe, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;

    let child = Command::new(exe)
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = child.wait_with_output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    for line in stdout.lines().chain(stderr.lines()) {
        debug!(target: "stagebuild::command", "{}", line);
    }

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout,
        stderr,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}
