//! GitLab-CI-shaped YAML definitions.
//!
//! Supports the subset of `.gitlab-ci.yml` that maps onto the Stageline model:
//! top-level `stages`, `variables`, `image` and `default.image`; every other
//! top-level mapping is a job with `stage`, `image`, `script`,
//! `allow_failure`, `variables` and `timeout`. Keys starting with `.` are
//! hidden templates and are skipped.

use crate::duration::parse_duration;
use crate::validate::validate;
use crate::{ConfigError, ConfigResult};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use stageline_core::pipeline::{AllowFailure, DEFAULT_JOB_STAGE, DEFAULT_STAGES, Job, Pipeline};
use std::collections::HashMap;
use tracing::debug;

/// Top-level keywords that never name a job.
const RESERVED_KEYWORDS: &[&str] = &[
    "stages",
    "variables",
    "image",
    "default",
    "include",
    "workflow",
    "before_script",
    "after_script",
    "cache",
    "services",
];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawImage {
    Name(String),
    Detailed { name: String },
}

impl RawImage {
    fn into_name(self) -> String {
        match self {
            RawImage::Name(name) | RawImage::Detailed { name } => name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScript {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawExitCodes {
    One(i32),
    Many(Vec<i32>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAllowFailure {
    Flag(bool),
    ExitCodes { exit_codes: RawExitCodes },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVariable {
    Detailed { value: Value },
    Plain(Value),
}

#[derive(Debug, Default, Deserialize)]
struct RawDefault {
    image: Option<RawImage>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    stage: Option<String>,
    image: Option<RawImage>,
    script: Option<RawScript>,
    allow_failure: Option<RawAllowFailure>,
    #[serde(default)]
    variables: HashMap<String, RawVariable>,
    timeout: Option<String>,
}

/// Parse and validate a GitLab-CI-shaped YAML definition.
pub fn parse_gitlab_ci(yaml: &str, name: &str) -> ConfigResult<Pipeline> {
    let root: Mapping = serde_yaml::from_str(yaml)?;

    let mut stages: Option<Vec<String>> = None;
    let mut env = HashMap::new();
    let mut default_image = String::new();
    let mut jobs = Vec::new();

    for (key, value) in &root {
        let Some(key) = key.as_str() else {
            return Err(ConfigError::invalid("top-level key", "keys must be strings"));
        };

        match key {
            "stages" => {
                stages = Some(serde_yaml::from_value(value.clone())?);
            }
            "variables" => {
                let raw: HashMap<String, RawVariable> = serde_yaml::from_value(value.clone())?;
                env = convert_variables(raw, "variables")?;
            }
            "image" => {
                let image: RawImage = serde_yaml::from_value(value.clone())?;
                default_image = image.into_name();
            }
            "default" => {
                let defaults: RawDefault = serde_yaml::from_value(value.clone())?;
                if let Some(image) = defaults.image {
                    default_image = image.into_name();
                }
            }
            hidden if hidden.starts_with('.') => {
                debug!(key = %hidden, "Skipping hidden job template");
            }
            reserved if RESERVED_KEYWORDS.contains(&reserved) => {
                debug!(keyword = %reserved, "Ignoring unsupported keyword");
            }
            job_name => {
                if !value.is_mapping() {
                    return Err(ConfigError::invalid(
                        format!("job '{}'", job_name),
                        "expected a mapping",
                    ));
                }
                let raw: RawJob = serde_yaml::from_value(value.clone())?;
                jobs.push(convert_job(job_name, raw)?);
            }
        }
    }

    for job in &mut jobs {
        if job.image.is_empty() {
            job.image = default_image.clone();
        }
    }

    let pipeline = Pipeline {
        name: name.to_string(),
        stages: stages
            .unwrap_or_else(|| DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()),
        jobs,
        env,
    };
    validate(&pipeline)?;
    Ok(pipeline)
}

fn convert_job(name: &str, raw: RawJob) -> ConfigResult<Job> {
    let script = match raw.script {
        Some(RawScript::One(cmd)) => vec![cmd],
        Some(RawScript::Many(cmds)) => cmds,
        None => Vec::new(),
    };

    let allow_failure = match raw.allow_failure {
        None => AllowFailure::Never,
        Some(RawAllowFailure::Flag(flag)) => AllowFailure::from_bool(flag),
        Some(RawAllowFailure::ExitCodes { exit_codes }) => match exit_codes {
            RawExitCodes::One(code) => AllowFailure::ExitCodes(vec![code]),
            RawExitCodes::Many(codes) => AllowFailure::ExitCodes(codes),
        },
    };

    let timeout = raw.timeout.as_deref().map(parse_duration).transpose()?;

    Ok(Job {
        name: name.to_string(),
        stage: raw.stage.unwrap_or_else(|| DEFAULT_JOB_STAGE.to_string()),
        image: raw.image.map(RawImage::into_name).unwrap_or_default(),
        script,
        allow_failure,
        env: convert_variables(raw.variables, &format!("variables of job '{}'", name))?,
        timeout,
    })
}

fn convert_variables(
    raw: HashMap<String, RawVariable>,
    field: &str,
) -> ConfigResult<HashMap<String, String>> {
    raw.into_iter()
        .map(|(key, var)| {
            let value = match var {
                RawVariable::Detailed { value } | RawVariable::Plain(value) => value,
            };
            scalar_to_string(&value)
                .map(|v| (key.clone(), v))
                .ok_or_else(|| {
                    ConfigError::invalid(field, format!("variable '{}' must be a scalar", key))
                })
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RUST_CI: &str = include_str!("../../../.gitlab-ci.yml");

    #[test]
    fn test_parse_rust_ci_matches_builtin() {
        let pipeline = parse_gitlab_ci(RUST_CI, "rust-toolchain").unwrap();
        let builtin = crate::builtin_pipeline().unwrap();
        assert_eq!(pipeline, builtin);
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let pipeline = parse_gitlab_ci(RUST_CI, "rust-toolchain").unwrap();
        let names: Vec<_> = pipeline.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "build-rust-latest",
                "build-rust-nightly",
                "test-rust-latest",
                "test-rust-nightly",
                "audit",
                "style"
            ]
        );
    }

    #[test]
    fn test_defaults_variables_and_templates() {
        let yaml = r#"
image: rust:latest
variables:
  CARGO_TERM_COLOR: always
  RUST_BACKTRACE: 1

.template:
  script: echo hidden

include:
  - local: other.yml

unit:
  script: cargo test
  timeout: 1h 30m
  variables:
    RUSTFLAGS:
      value: "-D warnings"
      description: deny warnings

flaky:
  image:
    name: rust:slim
  script: cargo test -- --ignored
  allow_failure:
    exit_codes: [137, 143]
"#;

        let pipeline = parse_gitlab_ci(yaml, "defaults").unwrap();
        assert_eq!(pipeline.stages, vec!["build", "test", "deploy"]);
        assert_eq!(pipeline.jobs.len(), 2);
        assert_eq!(pipeline.env.get("RUST_BACKTRACE").unwrap(), "1");

        let unit = pipeline.job("unit").unwrap();
        assert_eq!(unit.stage, "test");
        assert_eq!(unit.image, "rust:latest");
        assert_eq!(unit.script, vec!["cargo test"]);
        assert_eq!(unit.timeout, Some(Duration::from_secs(5400)));
        assert_eq!(unit.env.get("RUSTFLAGS").unwrap(), "-D warnings");

        let flaky = pipeline.job("flaky").unwrap();
        assert_eq!(flaky.image, "rust:slim");
        assert_eq!(flaky.allow_failure, AllowFailure::ExitCodes(vec![137, 143]));
    }

    #[test]
    fn test_default_section_image() {
        let yaml = r#"
default:
  image: alpine:3
lint:
  script: [ "true" ]
"#;
        let pipeline = parse_gitlab_ci(yaml, "default-image").unwrap();
        assert_eq!(pipeline.jobs[0].image, "alpine:3");
    }

    #[test]
    fn test_undeclared_stage_is_rejected() {
        let yaml = r#"
stages: [build]
release:
  stage: deploy
  image: alpine
  script: echo release
"#;
        assert!(matches!(
            parse_gitlab_ci(yaml, "bad").unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_job_must_be_mapping() {
        let yaml = "stages: [build]\nbroken: just a string\n";
        assert!(matches!(
            parse_gitlab_ci(yaml, "bad").unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_missing_script_is_rejected() {
        let yaml = "image: alpine\nnothing:\n  stage: test\n";
        assert!(matches!(
            parse_gitlab_ci(yaml, "bad").unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }
}
