//! Print the execution plan of a pipeline without running it.

use super::load_definition;
use anyhow::Result;
use stageline_config::duration::format_duration;
use stageline_core::pipeline::Pipeline;
use std::path::Path;

pub fn plan(file: Option<&Path>, dir: &Path, json: bool) -> Result<()> {
    let definition = load_definition(file, dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&definition.pipeline)?);
    } else {
        println!("Source: {}", definition.source);
        print!("{}", render_plan(&definition.pipeline));
    }
    Ok(())
}

/// Stages in execution order with their jobs, images, policies and scripts.
pub fn render_plan(pipeline: &Pipeline) -> String {
    let mut lines = vec![format!(
        "Pipeline: {} ({} stages, {} jobs)",
        pipeline.name,
        pipeline.stages.len(),
        pipeline.jobs.len()
    )];

    for (idx, stage) in pipeline.stages.iter().enumerate() {
        lines.push(String::new());
        lines.push(format!(
            "Stage {}/{}: {}",
            idx + 1,
            pipeline.stages.len(),
            stage
        ));

        let mut jobs = pipeline.jobs_in_stage(stage).peekable();
        if jobs.peek().is_none() {
            lines.push("  (no jobs)".to_string());
        }
        for job in jobs {
            lines.push(format!("  {} [{}] {}", job.name, job.image, job.allow_failure));
            if let Some(timeout) = job.timeout {
                lines.push(format!("    timeout {}", format_duration(timeout)));
            }
            for command in &job.script {
                lines.push(format!("    $ {}", command));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}
