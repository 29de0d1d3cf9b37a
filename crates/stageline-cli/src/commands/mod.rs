//! CLI command implementations.

pub mod init;
pub mod plan;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use stageline_config::runner::{RUNNER_CONFIG_FILE, load_runner_config};
use stageline_config::{RunnerConfig, builtin_pipeline, discover_pipeline, load_pipeline};
use stageline_core::pipeline::Pipeline;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a pipeline definition came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    File(PathBuf),
    Builtin,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => write!(f, "{}", path.display()),
            Source::Builtin => write!(f, "builtin pipeline"),
        }
    }
}

pub struct Definition {
    pub pipeline: Pipeline,
    pub source: Source,
}

/// Load `file`, or the first definition found in `dir`, or the builtin
/// pipeline when there is none.
pub fn load_definition(file: Option<&Path>, dir: &Path) -> Result<Definition> {
    let path = match file {
        Some(path) => Some(path.to_path_buf()),
        None => discover_pipeline(dir),
    };

    match path {
        Some(path) => {
            let pipeline = load_pipeline(&path).with_context(|| {
                format!("Failed to load pipeline definition: {}", path.display())
            })?;
            Ok(Definition {
                pipeline,
                source: Source::File(path),
            })
        }
        None => {
            debug!(dir = %dir.display(), "No definition file found, using builtin pipeline");
            let pipeline = builtin_pipeline().context("Builtin pipeline is invalid")?;
            Ok(Definition {
                pipeline,
                source: Source::Builtin,
            })
        }
    }
}

/// Read the runner configuration. An explicit path must exist; otherwise
/// `stageline-runner.kdl` in `dir` is used when present.
pub fn load_runner(config: Option<&Path>, dir: &Path) -> Result<RunnerConfig> {
    let path = match config {
        Some(path) => path.to_path_buf(),
        None => {
            let default = dir.join(RUNNER_CONFIG_FILE);
            if !default.is_file() {
                return Ok(RunnerConfig::default());
            }
            default
        }
    };

    load_runner_config(&path)
        .with_context(|| format!("Failed to load runner config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_falls_back_to_builtin_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let definition = load_definition(None, dir.path()).unwrap();
        assert_eq!(definition.source, Source::Builtin);
        assert_eq!(definition.pipeline.jobs.len(), 6);
    }

    #[test]
    fn test_discovers_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".gitlab-ci.yml"),
            "lint:\n  stage: test\n  image: alpine\n  script: make lint\n",
        )
        .unwrap();

        let definition = load_definition(None, dir.path()).unwrap();
        assert_eq!(
            definition.source,
            Source::File(dir.path().join(".gitlab-ci.yml"))
        );
        assert_eq!(definition.pipeline.jobs[0].name, "lint");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.kdl");
        assert!(load_definition(Some(&missing), dir.path()).is_err());
        assert!(load_runner(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_runner_config_lookup() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_runner(None, dir.path()).unwrap(),
            RunnerConfig::default()
        );

        fs::write(dir.path().join(RUNNER_CONFIG_FILE), "max-parallel 3\n").unwrap();
        assert_eq!(load_runner(None, dir.path()).unwrap().max_parallel, Some(3));
    }
}
