//! Command-line arguments.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;

/// Global options that take a separate value.
const VALUE_OPTIONS: [&str; 4] = ["-c", "--config", "--log-level", "--log-format"];

#[derive(Parser, Debug)]
#[command(name = "stagebuild", version, about = "Build service images from staged declarations")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Build configuration file
    #[arg(short, long, global = true, env = "STAGEBUILD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "STAGEBUILD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a declaration
    Build(BuildArgs),
    /// Validate a declaration without running anything
    Validate(DeclarationArgs),
    /// Show which stages would run, in dependency waves
    Plan(PlanArgs),
    /// Print the configuration of a built image
    Inspect(InspectArgs),
    /// Launch the entrypoint of a built image
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct DeclarationArgs {
    /// Declaration file
    #[arg(default_value = "stagebuild.toml")]
    pub declaration: PathBuf,

    /// Stage to build the image from (default: the last stage)
    #[arg(long)]
    pub target: Option<String>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub declaration: DeclarationArgs,

    /// Where images are published
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Where stage roots are assembled
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Maximum stages running at once
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Print the build report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub declaration: DeclarationArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Image directory
    pub image: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image directory
    pub image: PathBuf,

    /// Arguments for the entrypoint; none means its defaults
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Inserts `--` after the image of a `run` invocation, so everything that
/// follows reaches the entrypoint verbatim, including `--help` and the
/// global options. Other invocations are returned unchanged.
#[must_use]
pub fn protect_run_args(mut argv: Vec<OsString>) -> Vec<OsString> {
    let mut in_run = false;
    let mut i = 1;
    while i < argv.len() {
        let token = argv[i].to_string_lossy().into_owned();
        if token == "--" {
            break;
        }
        if token.len() > 1 && token.starts_with('-') {
            i += if VALUE_OPTIONS.contains(&token.as_str()) { 2 } else { 1 };
            continue;
        }
        if in_run {
            argv.insert(i + 1, OsString::from("--"));
            break;
        }
        if token != "run" {
            break;
        }
        in_run = true;
        i += 1;
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_run_passes_hyphen_args() {
        let args = CliArgs::parse_from(["stagebuild", "run", "images/assistant", "shell", "--debug"]);
        match args.command {
            Some(Commands::Run(run)) => assert_eq!(run.args, vec!["shell", "--debug"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn parse_run(argv: &[&str]) -> (CliArgs, Vec<String>) {
        let argv = protect_run_args(argv.iter().map(OsString::from).collect());
        let args = CliArgs::parse_from(argv);
        let passed = match &args.command {
            Some(Commands::Run(run)) => run.args.clone(),
            other => panic!("unexpected command: {other:?}"),
        };
        (args, passed)
    }

    #[test]
    fn test_run_args_are_not_global_options() {
        let (args, passed) = parse_run(&["stagebuild", "run", "img", "--config", "x.yml"]);
        assert_eq!(passed, vec!["--config", "x.yml"]);
        assert!(args.config.is_none());

        let (args, passed) = parse_run(&["stagebuild", "run", "img", "-v", "shell"]);
        assert_eq!(passed, vec!["-v", "shell"]);
        assert!(!args.verbose);

        let (_, passed) = parse_run(&["stagebuild", "run", "img", "--help"]);
        assert_eq!(passed, vec!["--help"]);
    }

    #[test]
    fn test_options_before_image_stay_global() {
        let (args, passed) = parse_run(&["stagebuild", "--config", "c.toml", "run", "-q", "img", "chat"]);
        assert_eq!(args.config, Some(PathBuf::from("c.toml")));
        assert!(args.quiet);
        assert_eq!(passed, vec!["chat"]);

        let (_, passed) = parse_run(&["stagebuild", "run", "img"]);
        assert!(passed.is_empty());
    }

    #[test]
    fn test_other_commands_unchanged() {
        let argv: Vec<OsString> = ["stagebuild", "build", "--json", "stagebuild.toml"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(protect_run_args(argv.clone()), argv);
    }

    #[test]
    fn test_no_command() {
        let args = CliArgs::parse_from(["stagebuild"]);
        assert!(args.command.is_none());
    }
}
