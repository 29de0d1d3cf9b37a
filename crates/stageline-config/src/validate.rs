//! Structural validation shared by every definition format.

use crate::{ConfigError, ConfigResult};
use stageline_core::pipeline::Pipeline;
use std::collections::HashSet;

/// Check a parsed pipeline before anything runs.
///
/// Stage names must be non-empty and unique, there must be at least one
/// job, job names must be unique, every job must reference a declared stage
/// and carry an image and a non-empty script.
pub fn validate(pipeline: &Pipeline) -> ConfigResult<()> {
    if pipeline.stages.is_empty() {
        return Err(ConfigError::MissingField("stages".to_string()));
    }

    let mut stages = HashSet::new();
    for stage in &pipeline.stages {
        if stage.trim().is_empty() {
            return Err(ConfigError::invalid("stages", "stage names must not be empty"));
        }
        if !stages.insert(stage.as_str()) {
            return Err(ConfigError::Duplicate(format!("stage '{}'", stage)));
        }
    }

    if pipeline.jobs.is_empty() {
        return Err(ConfigError::MissingField("jobs".to_string()));
    }

    let mut jobs = HashSet::new();
    for job in &pipeline.jobs {
        if job.name.trim().is_empty() {
            return Err(ConfigError::invalid("job name", "job names must not be empty"));
        }
        if !jobs.insert(job.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
        if !stages.contains(job.stage.as_str()) {
            return Err(ConfigError::InvalidReference(format!(
                "job '{}' references undeclared stage '{}'",
                job.name, job.stage
            )));
        }
        if job.image.trim().is_empty() {
            return Err(ConfigError::MissingField(format!("image for job '{}'", job.name)));
        }
        if job.script.is_empty() || job.script.iter().all(|c| c.trim().is_empty()) {
            return Err(ConfigError::MissingField(format!("script for job '{}'", job.name)));
        }
    }

    Ok(())
}
