//! Definition validation command.

use super::load_definition;
use anyhow::Result;
use std::path::Path;

/// Parse and validate `file`, or the definition found in `dir`. Errors carry
/// the parser's message and make the process exit non-zero.
pub fn validate(file: Option<&Path>, dir: &Path) -> Result<()> {
    let definition = load_definition(file, dir)?;
    let pipeline = &definition.pipeline;

    println!(
        "✓ {} is valid: pipeline '{}' with {} stages and {} jobs",
        definition.source,
        pipeline.name,
        pipeline.stages.len(),
        pipeline.jobs.len()
    );
    Ok(())
}
