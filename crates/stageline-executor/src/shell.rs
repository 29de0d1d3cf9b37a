//! Host shell executor.
//!
//! Runs the rendered job script with `sh -c` directly on the host, in the
//! workspace directory. The job's image is not used.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use stageline_core::executor::*;
use stageline_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Bookkeeping for one spawned script.
struct ShellJob {
    status: watch::Receiver<JobStatus>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    logs: Mutex<Option<mpsc::UnboundedReceiver<LogLine>>>,
}

pub struct ShellExecutor {
    shell: String,
    jobs: Mutex<HashMap<ResourceId, Arc<ShellJob>>>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Use a specific POSIX shell binary.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn job(&self, handle: &JobHandle) -> Result<Arc<ShellJob>> {
        self.jobs
            .lock()
            .map_err(|_| Error::Internal("shell job table poisoned".to_string()))?
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shell job {}", handle.id)))
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward output line by line. Undecodable bytes are replaced, and the
/// pipe is drained to the end even when nobody reads the logs.
async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let content = String::from_utf8_lossy(&buf);
                let content = content.trim_end_matches(['\n', '\r']);
                let _ = tx.send(LogLine::new(stream, content));
            }
            Err(e) => {
                warn!(error = %e, "Error reading job output");
                break;
            }
        }
    }
}

/// Kill the script and everything it started.
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "Process group already gone");
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        Command::new(&self.shell)
            .arg("-c")
            .arg("true")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        debug!(job = %spec.name, image = %spec.image, "Shell executor ignores the job image");

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(render_script(&spec.script))
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group, so cancel reaches every process the script starts.
            .process_group(0);
        if let Some(dir) = &spec.workspace {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start shell: {}", e)))?;
        let raw_pid = child.id();
        let pid = raw_pid.map(|p| p.to_string()).unwrap_or_default();
        info!(job = %spec.name, pid = %pid, "Started shell job");

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, log_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, log_tx));
        }

        let started_at = Utc::now();
        let (status_tx, status_rx) = watch::channel(JobStatus::Running { started_at });
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = child.wait() => Some(exit),
                Ok(()) = kill_rx => None,
            };

            let status = match exit {
                Some(Ok(exit)) => JobStatus::from_exit(exit.code(), started_at, Utc::now()),
                Some(Err(e)) => JobStatus::Failed {
                    started_at: Some(started_at),
                    finished_at: Utc::now(),
                    exit_code: None,
                    message: format!("Failed to wait for shell: {}", e),
                },
                None => {
                    kill_process_group(raw_pid);
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill shell job");
                    }
                    JobStatus::Cancelled {
                        started_at: Some(started_at),
                        cancelled_at: Utc::now(),
                    }
                }
            };
            let _ = status_tx.send(status);
        });

        let job = Arc::new(ShellJob {
            status: status_rx,
            kill: Mutex::new(Some(kill_tx)),
            logs: Mutex::new(Some(log_rx)),
        });
        self.jobs
            .lock()
            .map_err(|_| Error::Internal("shell job table poisoned".to_string()))?
            .insert(spec.id, job);

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let receiver = self
            .job(handle)?
            .logs
            .lock()
            .map_err(|_| Error::Internal("log receiver poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::InvalidInput(format!("logs of {} already taken", handle.id)))?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        Ok(self.job(handle)?.status.borrow().clone())
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let mut status = self.job(handle)?.status.clone();
        let status = status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("shell job {} vanished", handle.id)))?
            .clone();
        Ok(JobResult::from_status(status))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let kill = self
            .job(handle)?
            .kill
            .lock()
            .map_err(|_| Error::Internal("kill switch poisoned".to_string()))?
            .take();
        if let Some(kill) = kill {
            info!(job_id = %handle.id, "Killing shell job");
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        self.jobs
            .lock()
            .map_err(|_| Error::Internal("shell job table poisoned".to_string()))?
            .remove(&handle.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::path::PathBuf;

    fn spec(script: &[&str]) -> JobSpec {
        JobSpec {
            id: ResourceId::new(),
            name: "shell-test".to_string(),
            image: "ignored".to_string(),
            script: script.iter().map(|s| s.to_string()).collect(),
            workspace: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    async fn run(executor: &ShellExecutor, spec: JobSpec) -> (JobResult, Vec<LogLine>) {
        let handle = executor.spawn(spec).await.unwrap();
        let logs: Vec<LogLine> = executor.logs(&handle).await.unwrap().collect().await;
        let result = executor.wait(&handle).await.unwrap();
        executor.cleanup(&handle).await.unwrap();
        (result, logs)
    }

    #[tokio::test]
    async fn test_successful_script() {
        let executor = ShellExecutor::new();
        let (result, logs) = run(&executor, spec(&["echo one", "echo two"])).await;

        assert_eq!(result.exit_code, Some(0));
        assert!(matches!(result.status, JobStatus::Succeeded { .. }));

        let stdout: Vec<&str> = logs
            .iter()
            .filter(|l| l.stream == LogStream::Stdout)
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(stdout, vec!["$ echo one", "one", "$ echo two", "two"]);
    }

    #[tokio::test]
    async fn test_failing_command_stops_script() {
        let executor = ShellExecutor::new();
        let (result, logs) = run(&executor, spec(&["echo before", "exit 3", "echo after"])).await;

        assert_eq!(result.exit_code, Some(3));
        assert!(matches!(result.status, JobStatus::Failed { .. }));
        assert!(!logs.iter().any(|l| l.content == "after"));
    }

    #[tokio::test]
    async fn test_env_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = spec(&["echo $GREETING", "pwd"]);
        job.env.insert("GREETING".to_string(), "hello".to_string());
        job.workspace = Some(PathBuf::from(dir.path()));

        let executor = ShellExecutor::new();
        let (result, logs) = run(&executor, job).await;
        assert_eq!(result.exit_code, Some(0));

        let contents: Vec<&str> = logs.iter().map(|l| l.content.as_str()).collect();
        assert!(contents.contains(&"hello"));
        let expected = dir.path().canonicalize().unwrap();
        assert!(
            contents
                .iter()
                .any(|c| PathBuf::from(c).canonicalize().ok() == Some(expected.clone()))
        );
    }

    #[tokio::test]
    async fn test_stderr_is_tagged() {
        let executor = ShellExecutor::new();
        let (_, logs) = run(&executor, spec(&["echo oops >&2"])).await;
        assert!(
            logs.iter()
                .any(|l| l.stream == LogStream::Stderr && l.content == "oops")
        );
    }

    #[tokio::test]
    async fn test_cancel_kills_running_script() {
        let executor = ShellExecutor::new();
        let handle = executor.spawn(spec(&["sleep 30"])).await.unwrap();
        assert!(matches!(
            executor.status(&handle).await.unwrap(),
            JobStatus::Running { .. }
        ));

        executor.cancel(&handle).await.unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), executor.wait(&handle))
            .await
            .expect("cancel should end the job")
            .unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_non_utf8_output_does_not_break_the_job() {
        let executor = ShellExecutor::new();
        let (result, logs) = run(
            &executor,
            spec(&["printf 'caf\\351\\n'", "sleep 0.2", "echo after"]),
        )
        .await;

        assert_eq!(result.exit_code, Some(0));
        assert!(logs.iter().any(|l| l.content == "caf\u{FFFD}"));
        assert!(logs.iter().any(|l| l.content == "after"));
    }

    #[tokio::test]
    async fn test_output_is_drained_when_logs_are_not_read() {
        let executor = ShellExecutor::new();
        let handle = executor
            .spawn(spec(&["seq 1 20000", "echo done"]))
            .await
            .unwrap();
        drop(executor.logs(&handle).await.unwrap());

        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_cancel_kills_processes_started_by_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sh -c 'sleep 2; touch {}'", marker.display());

        let executor = ShellExecutor::new();
        let handle = executor.spawn(spec(&[script.as_str()])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        executor.cancel(&handle).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "grandchild survived cancellation");
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let executor = ShellExecutor::new();
        let handle = JobHandle {
            id: ResourceId::new(),
            executor_id: String::new(),
            executor_name: "shell".to_string(),
        };
        assert!(matches!(
            executor.status(&handle).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_can_execute() {
        assert!(ShellExecutor::new().can_execute(&spec(&["true"])).await);
        assert!(
            !ShellExecutor::with_shell("/nonexistent/shell")
                .can_execute(&spec(&["true"]))
                .await
        );
    }
}
