//! Pipeline orchestrator - runs stages in order and the jobs of each stage
//! concurrently.

use crate::handle::{CancelHandle, RunHandle};
use crate::job::{JobRunner, JobState};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use stageline_config::VariableContext;
use stageline_core::ResourceId;
use stageline_core::executor::{Executor, JobSpec, LogLine};
use stageline_core::pipeline::{AllowFailure, Job, Pipeline, PipelineStatus};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PipelineStarted { run_id: ResourceId, name: String },
    StageStarted { stage: String },
    JobStarted { stage: String, job: String },
    JobLog { job: String, line: LogLine },
    JobCompleted { stage: String, job: String, state: JobState },
    StageCompleted { stage: String, passed: bool },
    PipelineCompleted { status: PipelineStatus },
}

/// Final record of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub name: String,
    pub stage: String,
    pub allow_failure: AllowFailure,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobReport {
    fn pending(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            stage: job.stage.clone(),
            allow_failure: job.allow_failure.clone(),
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Result of a pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: ResourceId,
    pub name: String,
    pub status: PipelineStatus,
    /// Every job of the pipeline, in declaration order.
    pub jobs: Vec<JobReport>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Jobs that failed without affecting the pipeline status.
    pub fn allowed_failures(&self) -> Vec<&JobReport> {
        self.jobs
            .iter()
            .filter(|job| matches!(job.state, JobState::Failed { allowed: true, .. }))
            .collect()
    }
}

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    executor: Arc<dyn Executor>,
    /// Working directory mounted into every job environment
    working_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
    default_timeout: Option<Duration>,
}

impl PipelineOrchestrator {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            working_dir: None,
            max_parallel: None,
            default_timeout: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = Some(working_dir);
        self
    }

    /// Bound the number of jobs of one stage that run at the same time.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel.max(1));
        self
    }

    /// Timeout for jobs that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Execute a pipeline, returning a channel of events and a handle to the run.
    ///
    /// `env` is injected into every job below the pipeline and job variables.
    /// The `var_ctx` provides `${...}` interpolation for images, scripts and
    /// environment values.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        env: HashMap<String, String>,
        var_ctx: Option<VariableContext>,
    ) -> (mpsc::Receiver<PipelineEvent>, RunHandle) {
        let (tx, rx) = mpsc::channel(100);
        let (canceller, cancel_rx) = CancelHandle::new();
        let run_id = ResourceId::new();

        let mut var_ctx = var_ctx.unwrap_or_default();
        var_ctx.pipeline.id = run_id.to_string();
        var_ctx.pipeline.name = pipeline.name.clone();

        let mut base_env = env;
        base_env.extend(pipeline.env.clone());

        let run = Arc::new(PipelineRun {
            run_id,
            executor: self.executor.clone(),
            working_dir: self.working_dir.clone(),
            limit: self.max_parallel.map(|n| Arc::new(Semaphore::new(n))),
            default_timeout: self.default_timeout,
            env: base_env,
            var_ctx,
            events: tx,
            cancel: cancel_rx,
        });
        let pipeline = pipeline.clone();

        let task = tokio::spawn(async move { run.execute(pipeline).await });

        (rx, RunHandle::new(run_id, canceller, task))
    }
}

struct JobOutcome {
    index: usize,
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Shared state of one run, visible to all of its job tasks.
struct PipelineRun {
    run_id: ResourceId,
    executor: Arc<dyn Executor>,
    working_dir: Option<PathBuf>,
    limit: Option<Arc<Semaphore>>,
    default_timeout: Option<Duration>,
    env: HashMap<String, String>,
    var_ctx: VariableContext,
    events: mpsc::Sender<PipelineEvent>,
    cancel: watch::Receiver<bool>,
}

impl PipelineRun {
    async fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event).await;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn execute(self: Arc<Self>, pipeline: Pipeline) -> PipelineResult {
        info!(run_id = %self.run_id, pipeline = %pipeline.name, "Starting pipeline");
        self.emit(PipelineEvent::PipelineStarted {
            run_id: self.run_id,
            name: pipeline.name.clone(),
        })
        .await;

        let mut reports: Vec<JobReport> = pipeline.jobs.iter().map(JobReport::pending).collect();
        let mut status = PipelineStatus::Pending;

        for (stage_idx, stage) in pipeline.stages.iter().enumerate() {
            let members: Vec<usize> = pipeline
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| &job.stage == stage)
                .map(|(idx, _)| idx)
                .collect();

            if members.is_empty() {
                debug!(stage = %stage, "Stage has no jobs");
                continue;
            }

            if !status.is_terminal() && self.is_cancelled() {
                status = PipelineStatus::Cancelled;
            }

            if status.is_terminal() {
                let reason = match &status {
                    PipelineStatus::Failed { stage, .. } => format!("stage '{}' failed", stage),
                    _ => "pipeline cancelled".to_string(),
                };
                info!(stage = %stage, reason = %reason, "Skipping stage");
                for &idx in &members {
                    reports[idx].state = JobState::Skipped {
                        reason: reason.clone(),
                    };
                }
                continue;
            }

            status = PipelineStatus::Running {
                stage: stage.clone(),
            };
            info!(stage = %stage, jobs = members.len(), "Starting stage");
            self.emit(PipelineEvent::StageStarted {
                stage: stage.clone(),
            })
            .await;

            let mut tasks = JoinSet::new();
            for &idx in &members {
                let run = self.clone();
                let job = pipeline.jobs[idx].clone();
                tasks.spawn(async move { run.run_job(idx, stage_idx, job).await });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => {
                        let report = &mut reports[outcome.index];
                        report.state = outcome.state;
                        report.started_at = outcome.started_at;
                        report.finished_at = outcome.finished_at;
                    }
                    Err(e) => error!(stage = %stage, error = %e, "Job task failed"),
                }
            }

            // Reports left Pending lost their task and count as blocking.
            let blocking: Vec<String> = members
                .iter()
                .map(|&idx| &reports[idx])
                .filter(|report| report.state.is_blocking())
                .map(|report| report.name.clone())
                .collect();
            let cancelled = self.is_cancelled();

            self.emit(PipelineEvent::StageCompleted {
                stage: stage.clone(),
                passed: blocking.is_empty() && !cancelled,
            })
            .await;

            if cancelled {
                warn!(stage = %stage, "Pipeline cancelled");
                status = PipelineStatus::Cancelled;
            } else if !blocking.is_empty() {
                error!(stage = %stage, jobs = ?blocking, "Stage failed");
                status = PipelineStatus::Failed {
                    stage: stage.clone(),
                    jobs: blocking,
                };
            } else {
                info!(stage = %stage, "Stage passed");
            }
        }

        if !status.is_terminal() {
            status = PipelineStatus::Passed;
        }

        info!(run_id = %self.run_id, status = %status, "Pipeline finished");
        self.emit(PipelineEvent::PipelineCompleted {
            status: status.clone(),
        })
        .await;

        PipelineResult {
            run_id: self.run_id,
            name: pipeline.name,
            status,
            jobs: reports,
        }
    }

    async fn run_job(self: Arc<Self>, index: usize, stage_idx: usize, job: Job) -> JobOutcome {
        let _permit = match &self.limit {
            Some(limit) => limit.clone().acquire_owned().await.ok(),
            None => None,
        };

        if self.is_cancelled() {
            return JobOutcome {
                index,
                state: JobState::Skipped {
                    reason: "pipeline cancelled".to_string(),
                },
                started_at: None,
                finished_at: None,
            };
        }

        let started_at = Utc::now();
        self.emit(PipelineEvent::JobStarted {
            stage: job.stage.clone(),
            job: job.name.clone(),
        })
        .await;

        let runner = JobRunner {
            executor: self.executor.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        };
        let spec = self.job_spec(stage_idx, &job);

        let state = AssertUnwindSafe(runner.run(&job.stage, spec, &job.allow_failure))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(job = %job.name, "Job execution panicked");
                JobState::failed(None, "job execution panicked", &job.allow_failure)
            });

        match &state {
            JobState::Passed => info!(stage = %job.stage, job = %job.name, "Job passed"),
            JobState::Failed { allowed: true, .. } => {
                warn!(stage = %job.stage, job = %job.name, state = %state, "Job failed (allowed)")
            }
            _ => error!(stage = %job.stage, job = %job.name, state = %state, "Job did not pass"),
        }

        self.emit(PipelineEvent::JobCompleted {
            stage: job.stage.clone(),
            job: job.name.clone(),
            state: state.clone(),
        })
        .await;

        JobOutcome {
            index,
            state,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    /// Build the executor spec for `job`, with variables interpolated.
    ///
    /// Environment precedence, lowest first: predefined CI variables, run
    /// and pipeline variables, job variables.
    fn job_spec(&self, stage_idx: usize, job: &Job) -> JobSpec {
        let ctx = self
            .var_ctx
            .for_job(&job.stage, stage_idx, &job.name, &job.image);

        let mut env: HashMap<String, String> = [
            ("CI", "true"),
            ("STAGELINE", "true"),
            ("CI_PIPELINE_ID", ctx.pipeline.id.as_str()),
            ("CI_PIPELINE_NAME", ctx.pipeline.name.as_str()),
            ("CI_JOB_NAME", job.name.as_str()),
            ("CI_JOB_STAGE", job.stage.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        env.extend(self.env.clone());
        env.extend(job.env.clone());

        JobSpec {
            id: ResourceId::new(),
            name: job.name.clone(),
            image: ctx.interpolate(&job.image),
            script: ctx.interpolate_vec(&job.script),
            workspace: self.working_dir.clone(),
            env: ctx.interpolate_map(&env),
            timeout: job.timeout.or(self.default_timeout),
        }
    }
}
