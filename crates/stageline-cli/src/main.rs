//! Stageline CLI tool.

use clap::{Parser, Subcommand};
use stageline_core::executor::ExecutorKind;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "stageline", version)]
#[command(about = "Run stage-ordered CI pipelines locally", long_about = None)]
struct Cli {
    /// Runner configuration file
    #[arg(long, global = true, env = "STAGELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline on this machine
    Run {
        /// Definition file (defaults to stageline.kdl, then .gitlab-ci.yml)
        #[arg(short, long, env = "STAGELINE_FILE")]
        file: Option<PathBuf>,
        /// Only run jobs of this stage (repeatable)
        #[arg(long = "stage")]
        stages: Vec<String>,
        /// Only run this job (repeatable)
        #[arg(long = "job")]
        jobs: Vec<String>,
        /// Executor backend: docker or shell
        #[arg(long, env = "STAGELINE_EXECUTOR")]
        executor: Option<ExecutorKind>,
        /// Maximum number of concurrent jobs per stage
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Print the run result as JSON instead of progress output
        #[arg(long)]
        json: bool,
    },
    /// Validate a pipeline definition
    Validate {
        #[arg(short, long, env = "STAGELINE_FILE")]
        file: Option<PathBuf>,
    },
    /// Show stages and jobs without running them
    Plan {
        #[arg(short, long, env = "STAGELINE_FILE")]
        file: Option<PathBuf>,
        /// Print the parsed pipeline as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the builtin Rust pipeline as a starter definition
    Init {
        #[arg(short, long, default_value = "stageline.kdl")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            file,
            stages,
            jobs,
            executor,
            max_parallel,
            json,
        } => {
            let runner = commands::load_runner(cli.config.as_deref(), Path::new("."))?;
            let options = commands::run::RunOptions {
                file,
                stages,
                jobs,
                executor,
                max_parallel,
                json,
            };
            commands::run::run(options, runner).await?;
        }
        Commands::Validate { file } => {
            let runner = commands::load_runner(cli.config.as_deref(), Path::new("."))?;
            commands::validate::validate(file.as_deref(), &runner.workspace)?;
        }
        Commands::Plan { file, json } => {
            let runner = commands::load_runner(cli.config.as_deref(), Path::new("."))?;
            commands::plan::plan(file.as_deref(), &runner.workspace, json)?;
        }
        Commands::Init { output, force } => {
            commands::init::init(&output, force)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "stageline",
            "run",
            "--stage",
            "build",
            "--job",
            "audit",
            "--job",
            "style",
            "--executor",
            "shell",
            "--max-parallel",
            "2",
        ]);

        match cli.command {
            Commands::Run {
                stages,
                jobs,
                executor,
                max_parallel,
                json,
                ..
            } => {
                assert_eq!(stages, vec!["build"]);
                assert_eq!(jobs, vec!["audit", "style"]);
                assert_eq!(executor, Some(ExecutorKind::Shell));
                assert_eq!(max_parallel, Some(2));
                assert!(!json);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_rejects_unknown_executor() {
        assert!(Cli::try_parse_from(["stageline", "run", "--executor", "podman"]).is_err());
    }
}
