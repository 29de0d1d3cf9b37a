//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use stageline_core::executor::*;
use stageline_core::{Error, ResourceId, Result};
use tracing::{debug, info, warn};

/// Runs every job in a fresh container on the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("stageline-job-{}", job_id)
    }

    /// Container configuration for a job: the rendered script runs under
    /// `sh -c` with the workspace bind-mounted at [`CONTAINER_WORKSPACE`].
    fn container_config(spec: &JobSpec) -> Config<String> {
        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let binds = spec.workspace.as_ref().map(|dir| {
            vec![format!(
                "{}:{}:rw",
                dir.to_string_lossy(),
                CONTAINER_WORKSPACE
            )]
        });

        let host_config = HostConfig {
            binds,
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                render_script(&spec.script),
            ]),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "Pull warning");
                }
            }
        }
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(&Self::container_name(id), Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }
}

fn parse_docker_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.id);

        // A failed pull surfaces as a create error when the image is absent.
        self.pull_image(&spec.image).await;

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(job = %spec.name, container = %container_name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), Self::container_config(&spec))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            // No handle is returned, so nothing else would remove it.
            if let Err(remove_err) = self.remove(&spec.id).await {
                warn!(container = %container_name, error = %remove_err, "Failed to remove unstarted container");
            }
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&Self::container_name(&handle.id), Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    let content = String::from_utf8_lossy(&message).trim_end().to_string();
                    Some(LogLine::new(stream, content))
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let inspect = self
            .docker
            .inspect_container(&Self::container_name(&handle.id), None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("container has no state".to_string()))?;

        let started_at = parse_docker_time(state.started_at);

        if state.running.unwrap_or(false) {
            return Ok(JobStatus::Running {
                started_at: started_at.unwrap_or_else(Utc::now),
            });
        }
        if state.paused.unwrap_or(false) {
            return Ok(JobStatus::Pending);
        }

        let finished_at = parse_docker_time(state.finished_at).unwrap_or_else(Utc::now);
        let exit_code = state.exit_code.map(|c| c as i32);

        let status = match state.error.filter(|e| !e.is_empty()) {
            Some(message) if exit_code != Some(0) => JobStatus::Failed {
                started_at,
                finished_at,
                exit_code,
                message,
            },
            _ => JobStatus::from_exit(exit_code, started_at.unwrap_or(finished_at), finished_at),
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let current_status = self.status(handle).await?;
        if current_status.is_terminal() {
            return Ok(JobResult::from_status(current_status));
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };

        // Non-zero exits arrive as errors; the exit code is read back from
        // the container state below.
        let mut stream = self
            .docker
            .wait_container(&Self::container_name(&handle.id), Some(options));
        if let Some(Err(e)) = stream.next().await {
            debug!(job_id = %handle.id, error = %e, "Wait returned error");
        }

        let status = self.status(handle).await?;
        Ok(JobResult::from_status(status))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);
        info!(container = %container_name, "Stopping container");

        self.docker
            .stop_container(&container_name, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to stop container: {}", e)))
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        self.remove(&handle.id).await
    }
}
