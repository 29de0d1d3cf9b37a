//! Local pipeline execution command.

use super::{Source, load_definition};
use anyhow::{Context, Result};
use stageline_config::{RunnerConfig, VariableContext};
use stageline_core::executor::{ExecutorKind, LogStream};
use stageline_core::pipeline::{Pipeline, PipelineStatus};
use stageline_executor::create_executor;
use stageline_scheduler::{JobState, PipelineEvent, PipelineOrchestrator, PipelineResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Options of `stageline run`.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub file: Option<PathBuf>,
    pub stages: Vec<String>,
    pub jobs: Vec<String>,
    pub executor: Option<ExecutorKind>,
    pub max_parallel: Option<usize>,
    pub json: bool,
}

/// Run a pipeline on this machine.
pub async fn run(options: RunOptions, runner: RunnerConfig) -> Result<()> {
    let working_dir = runner.workspace.canonicalize().with_context(|| {
        format!(
            "Failed to resolve workspace directory: {}",
            runner.workspace.display()
        )
    })?;

    let definition = load_definition(options.file.as_deref(), &working_dir)?;
    let mut pipeline = definition.pipeline;
    select_jobs(&mut pipeline, &options.stages, &options.jobs)?;

    let kind = options.executor.unwrap_or(runner.executor);
    let executor = create_executor(kind)
        .with_context(|| format!("Failed to create {} executor", kind))?;

    let mut orchestrator =
        PipelineOrchestrator::new(executor).with_working_dir(working_dir.clone());
    if let Some(max_parallel) = options.max_parallel.or(runner.max_parallel) {
        orchestrator = orchestrator.with_max_parallel(max_parallel);
    }
    if let Some(timeout) = runner.default_timeout {
        orchestrator = orchestrator.with_default_timeout(timeout);
    }

    let mut var_ctx = VariableContext::from_git_repo(&working_dir);
    var_ctx.populate_env();

    if !options.json {
        print_header(&pipeline, &definition.source, kind, &working_dir);
    }

    let (mut rx, handle) = orchestrator.execute(&pipeline, runner.env.clone(), Some(var_ctx));

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            canceller.cancel();
        }
    });

    // Process events concurrently with execution
    while let Some(event) = rx.recv().await {
        if !options.json {
            println!("{}", describe_event(&event));
        }
    }

    let result = handle.wait().await.context("Pipeline execution task failed")?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    match &result.status {
        PipelineStatus::Passed => Ok(()),
        status => anyhow::bail!("Pipeline {}", status),
    }
}

/// Restrict `pipeline` to the named stages and jobs. Empty filters keep
/// everything.
pub fn select_jobs(pipeline: &mut Pipeline, stages: &[String], jobs: &[String]) -> Result<()> {
    if let Some(stage) = stages.iter().find(|s| pipeline.stage_index(s).is_none()) {
        anyhow::bail!("Unknown stage '{}'", stage);
    }
    if let Some(job) = jobs.iter().find(|j| pipeline.job(j).is_none()) {
        anyhow::bail!("Unknown job '{}'", job);
    }

    pipeline.retain_jobs(|job| {
        (stages.is_empty() || stages.contains(&job.stage))
            && (jobs.is_empty() || jobs.contains(&job.name))
    });

    if pipeline.jobs.is_empty() {
        anyhow::bail!("No jobs match the given stage and job filters");
    }
    Ok(())
}

fn print_header(pipeline: &Pipeline, source: &Source, kind: ExecutorKind, working_dir: &Path) {
    println!("Running pipeline: {} ({})", pipeline.name, source);
    println!("Stages: {}", pipeline.stages.join(" → "));
    println!("Executor: {}", kind);
    println!("Working directory: {}", working_dir.display());
    println!("\n--- Starting pipeline execution ---\n");
}

/// One line of console output for an event.
pub fn describe_event(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::PipelineStarted { run_id, name } => {
            format!("Pipeline '{}' started (run {})", name, run_id.short())
        }
        PipelineEvent::StageStarted { stage } => format!("▶ Stage '{}' started", stage),
        PipelineEvent::JobStarted { job, .. } => format!("  ▶ Job '{}' started", job),
        PipelineEvent::JobLog { job, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            format!("  [{}]{} {}", job, stream_marker, line.content)
        }
        PipelineEvent::JobCompleted { job, state, .. } => match state {
            JobState::Passed => format!("  ✓ Job '{}' passed", job),
            JobState::Failed {
                message,
                allowed: true,
                ..
            } => format!("  ⚠ Job '{}' failed (allowed): {}", job, message),
            JobState::Failed { message, .. } => format!("  ✗ Job '{}' failed: {}", job, message),
            JobState::Cancelled => format!("  ⊘ Job '{}' cancelled", job),
            other => format!("  Job '{}' {}", job, other),
        },
        PipelineEvent::StageCompleted { stage, passed } => {
            if *passed {
                format!("✓ Stage '{}' passed\n", stage)
            } else {
                format!("✗ Stage '{}' failed\n", stage)
            }
        }
        PipelineEvent::PipelineCompleted { status } => format!("--- Pipeline {} ---", status),
    }
}

fn print_summary(result: &PipelineResult) {
    println!("\n--- Job Summary ---");
    for job in &result.jobs {
        let marker = match &job.state {
            JobState::Passed => "✓",
            JobState::Failed { allowed: true, .. } => "⚠",
            JobState::Failed { .. } => "✗",
            JobState::Skipped { .. } | JobState::Cancelled => "⊘",
            JobState::Pending | JobState::Running => "○",
        };
        let elapsed = job
            .duration()
            .map(|d| format!(" in {:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "  {} {:<20} {:<8} {}{}",
            marker, job.name, job.stage, job.state, elapsed
        );
    }

    let allowed = result.allowed_failures();
    if !allowed.is_empty() {
        let names: Vec<&str> = allowed.iter().map(|job| job.name.as_str()).collect();
        println!("\nAllowed failures: {}", names.join(", "));
    }

    if result.success() {
        println!("\n✓ Pipeline succeeded!");
    } else {
        println!("\n✗ Pipeline {}", result.status);
    }
}
