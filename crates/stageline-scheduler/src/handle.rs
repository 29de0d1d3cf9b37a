//! Handles to a pipeline run in flight.

use crate::orchestrator::PipelineResult;
use stageline_core::{Error, ResourceId, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Cloneable switch that aborts a run, e.g. from a Ctrl-C handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Stop every running job and skip the ones not yet started.
    /// Calling this more than once has no further effect.
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            info!("Cancelling pipeline run");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A pipeline run started by [`crate::PipelineOrchestrator::execute`].
pub struct RunHandle {
    pub run_id: ResourceId,
    canceller: CancelHandle,
    task: JoinHandle<PipelineResult>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: ResourceId,
        canceller: CancelHandle,
        task: JoinHandle<PipelineResult>,
    ) -> Self {
        Self {
            run_id,
            canceller,
            task,
        }
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> CancelHandle {
        self.canceller.clone()
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<PipelineResult> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("pipeline task failed: {}", e)))
    }
}
