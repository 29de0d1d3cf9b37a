//! Pipeline, stage and job definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Stages used when a definition does not declare any.
pub const DEFAULT_STAGES: [&str; 3] = ["build", "test", "deploy"];

/// Stage assigned to a job that does not name one.
pub const DEFAULT_JOB_STAGE: &str = "test";

/// A pipeline definition: ordered stages and the jobs that belong to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (e.g., "rust-toolchain").
    pub name: String,
    /// Stage names in execution order.
    pub stages: Vec<String>,
    /// Jobs in declaration order.
    pub jobs: Vec<Job>,
    /// Environment variables shared by every job.
    pub env: HashMap<String, String>,
}

/// A unit of work executed in its own isolated environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job name, unique within the pipeline.
    pub name: String,
    /// Stage this job belongs to.
    pub stage: String,
    /// Container image reference.
    pub image: String,
    /// Shell commands, run in order.
    pub script: Vec<String>,
    /// Whether a failure of this job may be ignored.
    pub allow_failure: AllowFailure,
    /// Job-specific environment variables (override pipeline env).
    pub env: HashMap<String, String>,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

/// Failure policy of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowFailure {
    /// A failure fails the pipeline.
    #[default]
    Never,
    /// A failure is reported but never fails the pipeline.
    Always,
    /// Only exits with one of these codes are tolerated.
    ExitCodes(Vec<i32>),
}

impl AllowFailure {
    pub fn from_bool(allowed: bool) -> Self {
        if allowed { Self::Always } else { Self::Never }
    }

    /// Whether a failure that ended with `exit_code` is tolerated.
    ///
    /// Failures without an exit code (spawn errors, timeouts, cancellation)
    /// are only tolerated by [`AllowFailure::Always`].
    pub fn permits(&self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::ExitCodes(codes) => exit_code.is_some_and(|code| codes.contains(&code)),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

impl fmt::Display for AllowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "required"),
            Self::Always => write!(f, "allowed to fail"),
            Self::ExitCodes(codes) => {
                let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
                write!(f, "allowed to fail with exit codes {}", codes.join(", "))
            }
        }
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            jobs: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Position of a stage in execution order.
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Jobs of one stage, in declaration order.
    pub fn jobs_in_stage<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a Job> + 'a {
        self.jobs.iter().filter(move |job| job.stage == stage)
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Keep only the jobs matching `keep`. Stages left without jobs are dropped.
    pub fn retain_jobs<F>(&mut self, keep: F)
    where
        F: FnMut(&Job) -> bool,
    {
        self.jobs.retain(keep);
        let jobs = &self.jobs;
        self.stages.retain(|stage| jobs.iter().any(|job| &job.stage == stage));
    }
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        stage: impl Into<String>,
        image: impl Into<String>,
        script: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            image: image.into(),
            script,
            allow_failure: AllowFailure::Never,
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn allow_failure(mut self, policy: AllowFailure) -> Self {
        self.allow_failure = policy;
        self
    }
}

/// Overall status of a pipeline run.
///
/// `Pending -> Running{stage} -> ... -> Passed | Failed | Cancelled`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created but no stage has started.
    Pending,
    /// Jobs of `stage` are executing.
    Running { stage: String },
    /// Every required job passed.
    Passed,
    /// A required job in `stage` did not pass.
    Failed { stage: String, jobs: Vec<String> },
    /// Aborted externally.
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Passed | PipelineStatus::Failed { .. } | PipelineStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Passed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Pending => write!(f, "pending"),
            PipelineStatus::Running { stage } => write!(f, "running ({})", stage),
            PipelineStatus::Passed => write!(f, "passed"),
            PipelineStatus::Failed { stage, jobs } => {
                write!(f, "failed in stage '{}' ({})", stage, jobs.join(", "))
            }
            PipelineStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}
