//! Execution of a single job: spawn, stream logs, wait, clean up.

use crate::orchestrator::PipelineEvent;
use futures::StreamExt;
use serde::Serialize;
use stageline_config::duration::format_duration;
use stageline_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
use stageline_core::pipeline::AllowFailure;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// How long a log stream may keep draining once its job has ended.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State of a job during a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Passed,
    Failed {
        exit_code: Option<i32>,
        message: String,
        /// The job's failure policy tolerates this outcome.
        allowed: bool,
    },
    Skipped {
        reason: String,
    },
    Cancelled,
}

impl JobState {
    /// A failure, classified against the job's policy.
    pub fn failed(
        exit_code: Option<i32>,
        message: impl Into<String>,
        policy: &AllowFailure,
    ) -> Self {
        JobState::Failed {
            exit_code,
            message: message.into(),
            allowed: policy.permits(exit_code),
        }
    }

    /// Map the executor's final result onto a job state.
    pub fn classify(result: JobResult, policy: &AllowFailure) -> Self {
        let JobResult {
            status,
            exit_code: reported,
        } = result;

        match status {
            JobStatus::Succeeded { .. } => JobState::Passed,
            JobStatus::Failed {
                exit_code, message, ..
            } => JobState::failed(exit_code.or(reported), message, policy),
            JobStatus::Cancelled { .. } => JobState::Cancelled,
            JobStatus::Pending | JobStatus::Running { .. } => {
                JobState::failed(None, "Job ended in unexpected state", policy)
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Passed)
    }

    /// Whether this outcome keeps the pipeline from moving to the next stage.
    pub fn is_blocking(&self) -> bool {
        !matches!(
            self,
            JobState::Passed | JobState::Skipped { .. } | JobState::Failed { allowed: true, .. }
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Passed => write!(f, "passed"),
            JobState::Failed {
                message, allowed, ..
            } => {
                if *allowed {
                    write!(f, "failed, allowed ({})", message)
                } else {
                    write!(f, "failed ({})", message)
                }
            }
            JobState::Skipped { reason } => write!(f, "skipped ({})", reason),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

enum Outcome {
    Finished(stageline_core::Result<JobResult>),
    Cancelled,
    TimedOut(Duration),
}

/// Resolves once the run is cancelled. Never resolves if the cancel
/// sender is gone.
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn expiry(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            limit
        }
        None => std::future::pending().await,
    }
}

/// Drives one job through an executor.
pub(crate) struct JobRunner {
    pub executor: Arc<dyn Executor>,
    pub events: mpsc::Sender<PipelineEvent>,
    pub cancel: watch::Receiver<bool>,
}

impl JobRunner {
    /// Run `spec` to completion and classify the result with `policy`.
    ///
    /// Executor errors become a failed job; they never abort the run.
    pub async fn run(&self, stage: &str, spec: JobSpec, policy: &AllowFailure) -> JobState {
        let job = spec.name.clone();
        let timeout = spec.timeout;

        if !self.executor.can_execute(&spec).await {
            error!(stage = %stage, job = %job, "Executor cannot run job");
            return JobState::failed(
                None,
                format!("{} executor cannot run this job", self.executor.name()),
                policy,
            );
        }

        info!(stage = %stage, job = %job, image = %spec.image, "Spawning job");
        let handle = match self.executor.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(stage = %stage, job = %job, error = %e, "Failed to spawn job");
                return JobState::failed(None, format!("Failed to spawn job: {}", e), policy);
            }
        };

        let log_task = match self.executor.logs(&handle).await {
            Ok(mut stream) => {
                let events = self.events.clone();
                let job = job.clone();
                Some(tokio::spawn(async move {
                    while let Some(line) = stream.next().await {
                        let _ = events
                            .send(PipelineEvent::JobLog {
                                job: job.clone(),
                                line,
                            })
                            .await;
                    }
                }))
            }
            Err(e) => {
                warn!(job = %job, error = %e, "Failed to get logs");
                None
            }
        };

        let mut cancel = self.cancel.clone();
        let outcome = tokio::select! {
            result = self.executor.wait(&handle) => Outcome::Finished(result),
            _ = cancellation(&mut cancel) => Outcome::Cancelled,
            limit = expiry(timeout) => Outcome::TimedOut(limit),
        };

        let state = match outcome {
            Outcome::Finished(Ok(result)) => JobState::classify(result, policy),
            Outcome::Finished(Err(e)) => {
                JobState::failed(None, format!("Failed to wait for job: {}", e), policy)
            }
            Outcome::Cancelled => {
                info!(job = %job, "Cancelling job");
                self.notice(&job, "job cancelled".to_string()).await;
                self.stop(&handle).await;
                JobState::Cancelled
            }
            Outcome::TimedOut(limit) => {
                warn!(job = %job, timeout = %format_duration(limit), "Job timed out");
                let message = format!("timed out after {}", format_duration(limit));
                self.notice(&job, format!("job {}", message)).await;
                self.stop(&handle).await;
                JobState::failed(None, message, policy)
            }
        };

        // The stream may still be following a stopped environment.
        if let Some(mut task) = log_task {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        if let Err(e) = self.executor.cleanup(&handle).await {
            warn!(job = %job, error = %e, "Failed to clean up job environment");
        }

        state
    }

    /// Runner-side line in the job's log.
    async fn notice(&self, job: &str, message: String) {
        let _ = self
            .events
            .send(PipelineEvent::JobLog {
                job: job.to_string(),
                line: LogLine::new(LogStream::System, message),
            })
            .await;
    }

    async fn stop(&self, handle: &JobHandle) {
        if let Err(e) = self.executor.cancel(handle).await {
            warn!(job_id = %handle.id, error = %e, "Failed to cancel job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_classify_success_and_failure() {
        let now = Utc::now();
        let policy = AllowFailure::Never;

        let passed = JobState::classify(
            JobResult::from_status(JobStatus::from_exit(Some(0), now, now)),
            &policy,
        );
        assert_eq!(passed, JobState::Passed);
        assert!(!passed.is_blocking());

        let failed = JobState::classify(
            JobResult::from_status(JobStatus::from_exit(Some(101), now, now)),
            &policy,
        );
        assert_eq!(
            failed,
            JobState::Failed {
                exit_code: Some(101),
                message: "script exited with code 101".to_string(),
                allowed: false,
            }
        );
        assert!(failed.is_blocking());
    }

    #[test]
    fn test_classify_respects_exit_code_policy() {
        let now = Utc::now();
        let policy = AllowFailure::ExitCodes(vec![137]);

        let tolerated = JobState::classify(
            JobResult::from_status(JobStatus::from_exit(Some(137), now, now)),
            &policy,
        );
        assert!(!tolerated.is_blocking());

        let signalled = JobState::classify(
            JobResult::from_status(JobStatus::from_exit(None, now, now)),
            &policy,
        );
        assert!(signalled.is_blocking());
    }

    #[test]
    fn test_unfinished_status_is_a_failure() {
        let state = JobState::classify(
            JobResult::from_status(JobStatus::Pending),
            &AllowFailure::Always,
        );
        assert!(matches!(state, JobState::Failed { allowed: true, .. }));
    }

    #[test]
    fn test_blocking_states() {
        assert!(JobState::Pending.is_blocking());
        assert!(JobState::Cancelled.is_blocking());
        assert!(
            !JobState::Skipped {
                reason: "stage 'build' failed".into()
            }
            .is_blocking()
        );
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_display() {
        let state = JobState::failed(Some(1), "script exited with code 1", &AllowFailure::Always);
        assert_eq!(state.to_string(), "failed, allowed (script exited with code 1)");
        assert_eq!(JobState::Passed.to_string(), "passed");
    }
}
