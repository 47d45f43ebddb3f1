mod cli;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use cli::{protect_run_args, BuildArgs, CliArgs, Commands, DeclarationArgs, InspectArgs, LogFormat, PlanArgs, RunArgs};
use stagebuild::config::BuildConfig;
use stagebuild::declaration::BuildDeclaration;
use stagebuild::errors::BuildError;
use stagebuild::image::{Image, Launcher};
use stagebuild::runner::BuildRunner;
use std::env;
use std::path::Path;
use std::process;
use tracing::{debug, error, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse_from(protect_run_args(env::args_os().collect()));
    init_logging_from_args(&args);

    debug!("stagebuild v{} starting", stagebuild::VERSION);
    debug!("Arguments: {:?}", args);

    let Some(command) = &args.command else {
        let _ = CliArgs::command().print_help();
        println!();
        process::exit(0);
    };

    let exit_code = match dispatch(command, args.config.as_deref()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    let level = if let Some(level_str) = &args.log_level {
        parse_level(level_str)
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let mut filter = EnvFilter::from_default_env();
    if env::var("RUST_LOG").is_err() {
        for directive in [format!("stagebuild={level}"), "hyper=warn".into(), "reqwest=warn".into()] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    let json = args.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(true).with_writer(std::io::stderr)))
        .init();
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{level_str}', defaulting to INFO. Valid levels: trace, debug, info, warn, error"
            );
            Level::INFO
        }
    }
}

async fn dispatch(command: &Commands, config_path: Option<&Path>) -> Result<i32> {
    match command {
        Commands::Build(args) => handle_build(args, config_path).await,
        Commands::Validate(args) => handle_validate(args, config_path),
        Commands::Plan(args) => handle_plan(args, config_path),
        Commands::Inspect(args) => handle_inspect(args),
        Commands::Run(args) => handle_run(args).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<BuildConfig> {
    match path {
        Some(path) => Ok(BuildConfig::load(path)?),
        None => Ok(BuildConfig::default().with_env_overrides()),
    }
}

fn load_declaration(args: &DeclarationArgs) -> Result<BuildDeclaration> {
    let mut declaration = BuildDeclaration::load(&args.declaration)
        .with_context(|| format!("failed to load declaration {}", args.declaration.display()))?;
    if let Some(target) = &args.target {
        declaration.target = Some(target.clone());
    }
    Ok(declaration)
}

async fn handle_build(args: &BuildArgs, config_path: Option<&Path>) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = &args.output_dir {
        config.output_dir.clone_from(dir);
    }
    if let Some(dir) = &args.work_dir {
        config.work_dir.clone_from(dir);
    }
    if let Some(jobs) = args.jobs {
        config.max_parallel_stages = jobs;
    }

    let declaration = load_declaration(&args.declaration)?;
    let report = BuildRunner::new(config)
        .build(&declaration)
        .await
        .with_context(|| format!("build of '{}' failed", declaration.name))?;

    if args.json {
        let summary = serde_json::json!({
            "image": report.image.config().name,
            "id": report.image.id(),
            "dir": report.image.dir().display().to_string(),
            "stages": report.stages,
            "dependencies": report.image.dependencies(),
            "duration_ms": report.duration_ms,
            "instructions": report.instructions,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", report.image.id());
        println!("{}", report.image.dir().display());
    }
    Ok(0)
}

fn handle_validate(args: &DeclarationArgs, config_path: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let declaration = load_declaration(args)?;

    match BuildRunner::new(config).validate(&declaration) {
        Ok(graph) => {
            println!(
                "{}: {} stages, target '{}' needs {}",
                graph.name(),
                graph.stage_count(),
                graph.target(),
                graph.execution_order().join(", ")
            );
            Ok(0)
        }
        Err(BuildError::Validation(e)) => {
            eprintln!("invalid: {e}");
            if let Some(info) = &e.error_info {
                eprintln!("  code: {}", info.code);
                if let Some(hint) = &info.fix_hint {
                    eprintln!("  hint: {hint}");
                }
            }
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn handle_plan(args: &PlanArgs, config_path: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let declaration = load_declaration(&args.declaration)?;
    let plan = BuildRunner::new(config).plan(&declaration)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    println!("{} (target: {})", plan.name, plan.target);
    for (index, wave) in plan.waves.iter().enumerate() {
        println!("  wave {}: {}", index + 1, wave.join(", "));
    }
    for (stage, role) in &plan.roles {
        println!("  {stage}: {role}");
    }
    Ok(0)
}

fn handle_inspect(args: &InspectArgs) -> Result<i32> {
    let image = Image::load(&args.image).with_context(|| format!("no image at {}", args.image.display()))?;
    println!("{}", serde_json::to_string_pretty(image.config())?);
    Ok(0)
}

async fn handle_run(args: &RunArgs) -> Result<i32> {
    let image = Image::load(&args.image).with_context(|| format!("no image at {}", args.image.display()))?;
    Ok(Launcher::new(&image).run(&args.args).await?)
}
