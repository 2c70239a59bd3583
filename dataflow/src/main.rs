//! Dataflow pipeline runner.
//!
//! Loads a JSON pipeline document, validates it and runs it with the engine
//! configured by `dataflow.toml` and command-line flags.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dataflow::core::analysis::analyze;
use dataflow::engine::{Engine, TaskStatus};
use dataflow::error::EngineError;
use dataflow::exit_codes;
use dataflow::io::config::{CONFIG_FILE, load_config};
use dataflow::io::pipeline::{load_pipeline, parse_param_assignments};
use dataflow::logging;

#[derive(Parser)]
#[command(
    name = "dataflow",
    version,
    about = "Single-assignment dataflow runner for pipelines of external tools"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline to completion.
    Run(RunArgs),
    /// Validate a pipeline without running anything.
    Check {
        /// Pipeline document (JSON).
        pipeline: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Pipeline document (JSON).
    pipeline: PathBuf,
    /// Top-level parameter, `NAME=VALUE`; may be repeated.
    #[arg(short = 'p', long = "param")]
    params: Vec<String>,
    /// Number of worker threads.
    #[arg(short = 'j', long)]
    jobs: Option<usize>,
    /// Config file; defaults to `dataflow.toml` in the current directory.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Working directory of tools and root of fixed mappings.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Keep running independent tasks after a failure.
    #[arg(long)]
    keep_going: bool,
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            let invalid = err.downcast_ref::<EngineError>().is_none_or(|engine| {
                matches!(
                    engine,
                    EngineError::InvalidProgram(_)
                        | EngineError::Dependency(_)
                        | EngineError::DoubleAssignment { .. }
                        | EngineError::TypeMismatch { .. }
                )
            });
            exit(if invalid {
                exit_codes::INVALID
            } else {
                exit_codes::FAILED
            })
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Check { pipeline } => cmd_check(&pipeline),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let config_path = args.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let mut config = load_config(&config_path)?;
    if let Some(jobs) = args.jobs {
        config.parallelism = jobs;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    if args.keep_going {
        config.fail_fast = false;
    }
    config.validate().context("invalid configuration")?;

    let program = load_pipeline(&args.pipeline)?;
    let params = parse_param_assignments(&args.params)?;
    let report = Engine::new(config)
        .run(&program, &params)
        .with_context(|| format!("run {}", args.pipeline.display()))?;

    for task in &report.tasks {
        match &task.status {
            TaskStatus::Failed(err) => eprintln!("failed: {} ({}): {err}", task.label, task.id),
            TaskStatus::Cancelled => eprintln!("cancelled: {} ({})", task.label, task.id),
            TaskStatus::Succeeded | TaskStatus::UpstreamFailed(_) => {}
        }
    }
    eprintln!(
        "{} tasks in {:.2?}; run directory {}",
        report.tasks.len(),
        report.elapsed,
        report.run_dir.display()
    );
    Ok(if report.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_check(pipeline: &Path) -> Result<i32> {
    let program = load_pipeline(pipeline)?;
    let errors = analyze(&program);
    if errors.is_empty() {
        println!("{}: ok", pipeline.display());
        return Ok(exit_codes::OK);
    }
    for err in &errors {
        eprintln!("{}: {err}", pipeline.display());
    }
    Ok(exit_codes::INVALID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_params() {
        let cli = Cli::parse_from([
            "dataflow",
            "run",
            "p.json",
            "-p",
            "a=1",
            "--param",
            "b=2",
            "-j",
            "3",
            "--keep-going",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.params, vec!["a=1", "b=2"]);
                assert_eq!(args.jobs, Some(3));
                assert!(args.keep_going);
            }
            Command::Check { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn parse_check() {
        let cli = Cli::parse_from(["dataflow", "check", "p.json"]);
        assert!(matches!(cli.command, Command::Check { .. }));
    }
}
