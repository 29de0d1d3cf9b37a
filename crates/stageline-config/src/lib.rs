//! Pipeline definition parsing for Stageline.
//!
//! This crate handles:
//! - Pipeline definitions in KDL (stageline.kdl)
//! - GitLab-CI-shaped YAML definitions (.gitlab-ci.yml)
//! - Definition validation
//! - Runner configuration
//! - Variable interpolation

pub mod builtin;
pub mod duration;
pub mod error;
pub mod gitlab;
pub mod load;
mod nodes;
pub mod pipeline;
pub mod runner;
pub mod validate;
pub mod variables;

pub use builtin::{BUILTIN_PIPELINE_KDL, builtin_pipeline};
pub use error::{ConfigError, ConfigResult};
pub use load::{PIPELINE_FILE_NAMES, discover_pipeline, load_pipeline};
pub use runner::RunnerConfig;
pub use variables::{
    GitContext, JobContext, PipelineContext, StageContext, VariableContext, VariableContextBuilder,
};
