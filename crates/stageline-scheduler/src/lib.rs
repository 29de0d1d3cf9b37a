//! Pipeline orchestration for Stageline.
//!
//! Runs the stages of a pipeline in order, the jobs of a stage concurrently,
//! and decides after every stage whether the pipeline may continue.

pub mod handle;
pub mod job;
pub mod orchestrator;

pub use handle::{CancelHandle, RunHandle};
pub use job::JobState;
pub use orchestrator::{JobReport, PipelineEvent, PipelineOrchestrator, PipelineResult};
