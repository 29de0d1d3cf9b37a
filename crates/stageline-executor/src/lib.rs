//! Job execution backends for Stageline.
//!
//! Provides executor implementations for running CI jobs:
//! - Local Docker (one container per job)
//! - Host shell (development, no isolation beyond the process)

pub mod docker;
pub mod shell;

use std::sync::Arc;

pub use docker::LocalDockerExecutor;
pub use shell::ShellExecutor;
pub use stageline_core::executor::{
    Executor, ExecutorKind, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};

/// Build the executor backend selected by `kind`.
pub fn create_executor(kind: ExecutorKind) -> stageline_core::Result<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = match kind {
        ExecutorKind::Docker => Arc::new(LocalDockerExecutor::new()?),
        ExecutorKind::Shell => Arc::new(ShellExecutor::new()),
    };
    Ok(executor)
}
