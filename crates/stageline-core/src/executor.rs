//! Executor trait and job types.
//!
//! Executors run CI jobs in isolated environments (containers, host shells).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, ResourceId, Result};

/// Mount point of the workspace inside container environments.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Available executor backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// One container per job on the local Docker daemon.
    #[default]
    Docker,
    /// One `sh` process per job on the host. The image is not used.
    Shell,
}

impl std::str::FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(ExecutorKind::Docker),
            "shell" => Ok(ExecutorKind::Shell),
            other => Err(Error::InvalidInput(format!(
                "unknown executor '{}' (expected docker or shell)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Docker => write!(f, "docker"),
            ExecutorKind::Shell => write!(f, "shell"),
        }
    }
}

/// Specification for a job to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job environment.
    pub id: ResourceId,
    /// Job name from the pipeline definition.
    pub name: String,
    /// Container image to run.
    pub image: String,
    /// Shell commands, executed in order until one fails.
    pub script: Vec<String>,
    /// Host directory holding the project checkout.
    pub workspace: Option<PathBuf>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    /// The job ID.
    pub id: ResourceId,
    /// Executor-specific identifier (e.g., container ID, process ID).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is waiting to start.
    Pending,
    /// Job is currently running.
    Running { started_at: DateTime<Utc> },
    /// Job completed successfully.
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Job failed.
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    /// Job was cancelled.
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Classify a process exit code.
    pub fn from_exit(
        exit_code: Option<i32>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        match exit_code {
            Some(0) => JobStatus::Succeeded {
                started_at,
                finished_at,
            },
            Some(code) => JobStatus::Failed {
                started_at: Some(started_at),
                finished_at,
                exit_code: Some(code),
                message: format!("script exited with code {}", code),
            },
            None => JobStatus::Failed {
                started_at: Some(started_at),
                finished_at,
                exit_code: None,
                message: "script terminated by signal".to_string(),
            },
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Final status.
    pub status: JobStatus,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

impl JobResult {
    pub fn from_status(status: JobStatus) -> Self {
        let exit_code = status.exit_code();
        Self { status, exit_code }
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Render a job script as a POSIX shell program.
///
/// Each command is echoed before it runs and the shell stops at the first
/// command that exits non-zero.
pub fn render_script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    for command in commands {
        script.push_str("echo ");
        script.push_str(&shell_quote(&format!("$ {}", command)));
        script.push('\n');
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Check if this executor can handle the given job spec.
    async fn can_execute(&self, spec: &JobSpec) -> bool;

    /// Provision the environment and start the job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Get a stream of log lines from a job.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to complete.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Terminate a running job and its environment.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Release the job's environment once its result has been collected.
    async fn cleanup(&self, _handle: &JobHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_script_echoes_and_stops_on_error() {
        let script = render_script(&[
            "cargo build --verbose".to_string(),
            "cargo audit".to_string(),
        ]);
        assert_eq!(
            script,
            "set -e\necho '$ cargo build --verbose'\ncargo build --verbose\necho '$ cargo audit'\ncargo audit\n"
        );
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!("docker".parse::<ExecutorKind>().unwrap(), ExecutorKind::Docker);
        assert_eq!("Shell".parse::<ExecutorKind>().unwrap(), ExecutorKind::Shell);
        assert!("podman".parse::<ExecutorKind>().is_err());
        assert_eq!(ExecutorKind::default().to_string(), "docker");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_job_status_from_exit() {
        let now = Utc::now();
        assert!(matches!(
            JobStatus::from_exit(Some(0), now, now),
            JobStatus::Succeeded { .. }
        ));

        let failed = JobStatus::from_exit(Some(101), now, now);
        assert_eq!(failed.exit_code(), Some(101));
        assert!(failed.is_terminal());

        let killed = JobStatus::from_exit(None, now, now);
        assert_eq!(killed.exit_code(), None);
        assert!(matches!(killed, JobStatus::Failed { .. }));
    }

    #[test]
    fn test_job_status_variants() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(
            !JobStatus::Running {
                started_at: Utc::now()
            }
            .is_terminal()
        );
        assert!(
            JobStatus::Cancelled {
                started_at: None,
                cancelled_at: Utc::now(),
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_job_result_carries_exit_code() {
        let now = Utc::now();
        let result = JobResult::from_status(JobStatus::from_exit(Some(3), now, now));
        assert_eq!(result.exit_code, Some(3));
    }
}
