//! Runner configuration parsing.
//!
//! ```kdl
//! executor "docker"
//! max-parallel 4
//! default-timeout "1h"
//! workspace "."
//! env {
//!     CARGO_TERM_COLOR "always"
//! }
//! ```

use crate::nodes::{duration_arg, env_block, first_string_arg, positional_args};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use stageline_core::executor::ExecutorKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default runner configuration file name.
pub const RUNNER_CONFIG_FILE: &str = "stageline-runner.kdl";

/// Settings of the machine running pipelines, as opposed to the pipeline
/// definition itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Backend providing job environments.
    pub executor: ExecutorKind,
    /// Upper bound on concurrently running jobs within a stage.
    pub max_parallel: Option<usize>,
    /// Timeout for jobs that do not declare one.
    pub default_timeout: Option<Duration>,
    /// Project checkout mounted into every job.
    pub workspace: PathBuf,
    /// Extra environment variables injected into every job.
    pub env: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::default(),
            max_parallel: None,
            default_timeout: None,
            workspace: PathBuf::from("."),
            env: HashMap::new(),
        }
    }
}

/// Parse runner configuration from KDL text. Every field is optional.
pub fn parse_runner_config(kdl: &str) -> ConfigResult<RunnerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = RunnerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "executor" => {
                let kind = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("executor kind".to_string()))?;
                config.executor = kind.parse().map_err(|e: stageline_core::Error| {
                    ConfigError::invalid("executor", e.to_string())
                })?;
            }
            "max-parallel" => {
                let value = positional_args(node)
                    .first()
                    .and_then(|v| v.as_integer())
                    .and_then(|n| usize::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        ConfigError::invalid("max-parallel", "expected a positive integer")
                    })?;
                config.max_parallel = Some(value);
            }
            "default-timeout" => {
                config.default_timeout = duration_arg(node, "default-timeout")?;
            }
            "workspace" => {
                let path = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workspace path".to_string()))?;
                config.workspace = PathBuf::from(path);
            }
            "env" => {
                config.env.extend(env_block(node));
            }
            other => debug!(node = %other, "Ignoring unknown runner config node"),
        }
    }

    Ok(config)
}

/// Read runner configuration from a file.
pub fn load_runner_config(path: &Path) -> ConfigResult<RunnerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_runner_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_runner_config("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.executor, ExecutorKind::Docker);
    }

    #[test]
    fn test_full_config() {
        let config = parse_runner_config(
            r#"
            executor "shell"
            max-parallel 2
            default-timeout "45m"
            workspace "/srv/checkout"
            env {
                CARGO_TERM_COLOR "always"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.executor, ExecutorKind::Shell);
        assert_eq!(config.max_parallel, Some(2));
        assert_eq!(config.default_timeout, Some(Duration::from_secs(2700)));
        assert_eq!(config.workspace, PathBuf::from("/srv/checkout"));
        assert_eq!(config.env.get("CARGO_TERM_COLOR").unwrap(), "always");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            parse_runner_config("executor \"podman\"").unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
        assert!(matches!(
            parse_runner_config("max-parallel 0").unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
        assert!(matches!(
            parse_runner_config("default-timeout \"soon\"").unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RUNNER_CONFIG_FILE);
        std::fs::write(&path, "default-timeout 120\n").unwrap();

        let config = load_runner_config(&path).unwrap();
        assert_eq!(config.default_timeout, Some(Duration::from_secs(120)));
    }
}
