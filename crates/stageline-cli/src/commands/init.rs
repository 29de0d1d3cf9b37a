//! Write a starter definition.

use anyhow::{Context, Result};
use stageline_config::BUILTIN_PIPELINE_KDL;
use std::path::Path;

/// Write the builtin Rust toolchain pipeline to `output`. An existing file
/// is only replaced with `force`.
pub fn init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    std::fs::write(output, BUILTIN_PIPELINE_KDL)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}
