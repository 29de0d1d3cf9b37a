//! Pipeline definition parsing from KDL.
//!
//! ```kdl
//! pipeline "rust-toolchain"
//! stages "build" "test"
//! image "rust:latest"
//!
//! job "build-rust-nightly" stage="build" allow-failure=#true {
//!     image "rustlang/rust:nightly"
//!     run "cargo build --verbose"
//! }
//! ```

use crate::nodes::{
    all_string_args, bool_prop, duration_arg, duration_prop, env_block, first_string_arg,
    positional_args, string_prop,
};
use crate::validate::validate;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use stageline_core::pipeline::{AllowFailure, DEFAULT_JOB_STAGE, DEFAULT_STAGES, Job, Pipeline};
use std::collections::HashMap;
use tracing::debug;

/// Parse and validate a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut stages: Option<Vec<String>> = None;
    let mut default_image = String::new();
    let mut jobs = Vec::new();
    let mut env = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "stages" => {
                stages = Some(all_string_args(node));
            }
            "image" => {
                default_image = first_string_arg(node).unwrap_or_default();
            }
            "env" => {
                env.extend(env_block(node));
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            other => debug!(node = %other, "Ignoring unknown pipeline node"),
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    for job in &mut jobs {
        if job.image.is_empty() {
            job.image = default_image.clone();
        }
    }

    let pipeline = Pipeline {
        name,
        stages: stages
            .unwrap_or_else(|| DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()),
        jobs,
        env,
    };
    validate(&pipeline)?;
    Ok(pipeline)
}

fn parse_job(node: &KdlNode) -> ConfigResult<Job> {
    let name =
        first_string_arg(node).ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut stage = string_prop(node, "stage");
    let mut allow_failure = bool_prop(node, "allow-failure")
        .map(AllowFailure::from_bool)
        .unwrap_or_default();
    let mut timeout = duration_prop(node, "timeout")?;
    let mut image = String::new();
    let mut script = Vec::new();
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "stage" => stage = first_string_arg(child),
                "image" => {
                    image = first_string_arg(child).unwrap_or_default();
                }
                "run" => {
                    if let Some(cmd) = first_string_arg(child) {
                        script.push(cmd);
                    }
                }
                "env" => {
                    env.extend(env_block(child));
                }
                "timeout" => {
                    timeout = duration_arg(child, "timeout")?;
                }
                "allow-failure" => {
                    allow_failure = parse_allow_failure(child, &name)?;
                }
                other => debug!(job = %name, node = %other, "Ignoring unknown job node"),
            }
        }
    }

    Ok(Job {
        name,
        stage: stage.unwrap_or_else(|| DEFAULT_JOB_STAGE.to_string()),
        image,
        script,
        allow_failure,
        env,
        timeout,
    })
}

/// `allow-failure #true` or `allow-failure 137 255` (tolerated exit codes).
fn parse_allow_failure(node: &KdlNode, job: &str) -> ConfigResult<AllowFailure> {
    let args = positional_args(node);
    let field = format!("allow-failure of job '{}'", job);

    if let [value] = args.as_slice() {
        if let Some(flag) = value.as_bool() {
            return Ok(AllowFailure::from_bool(flag));
        }
    }

    let mut codes = Vec::with_capacity(args.len());
    for value in args {
        let code = value
            .as_integer()
            .and_then(|i| i32::try_from(i).ok())
            .ok_or_else(|| ConfigError::invalid(&field, "expected #true, #false or exit codes"))?;
        codes.push(code);
    }

    if codes.is_empty() {
        return Err(ConfigError::invalid(field, "missing value"));
    }
    Ok(AllowFailure::ExitCodes(codes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_simple_pipeline() {
        let kdl = r#"
            pipeline "test-pipeline"
            stages "build"

            job "compile" stage="build" {
                image "rust:1.75"
                run "cargo build"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.name, "test-pipeline");
        assert_eq!(pipeline.stages, vec!["build"]);
        assert_eq!(pipeline.jobs.len(), 1);
        assert_eq!(pipeline.jobs[0].name, "compile");
        assert_eq!(pipeline.jobs[0].script, vec!["cargo build"]);
        assert!(pipeline.jobs[0].allow_failure.is_never());
    }

    #[test]
    fn test_parse_allow_failure_forms() {
        let kdl = r#"
            pipeline "policies"
            stages "build"
            image "alpine"

            job "prop" stage="build" allow-failure=#true {
                run "true"
            }
            job "child" stage="build" {
                allow-failure #true
                run "true"
            }
            job "codes" stage="build" {
                allow-failure 137 255
                run "true"
            }
            job "required" stage="build" allow-failure=#false {
                run "true"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.job("prop").unwrap().allow_failure, AllowFailure::Always);
        assert_eq!(pipeline.job("child").unwrap().allow_failure, AllowFailure::Always);
        assert_eq!(
            pipeline.job("codes").unwrap().allow_failure,
            AllowFailure::ExitCodes(vec![137, 255])
        );
        assert_eq!(pipeline.job("required").unwrap().allow_failure, AllowFailure::Never);
    }

    #[test]
    fn test_default_image_env_and_timeout() {
        let kdl = r#"
            pipeline "defaults"
            stages "test"
            image "rust:latest"
            env {
                CARGO_TERM_COLOR "always"
            }

            job "unit" stage="test" timeout="10m" {
                run "cargo test"
                env {
                    RUST_BACKTRACE 1
                }
            }
            job "slow" stage="test" {
                image "rust:slim"
                timeout 7200
                run "cargo test -- --ignored"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.env.get("CARGO_TERM_COLOR").unwrap(), "always");

        let unit = pipeline.job("unit").unwrap();
        assert_eq!(unit.image, "rust:latest");
        assert_eq!(unit.timeout, Some(Duration::from_secs(600)));
        assert_eq!(unit.env.get("RUST_BACKTRACE").unwrap(), "1");

        let slow = pipeline.job("slow").unwrap();
        assert_eq!(slow.image, "rust:slim");
        assert_eq!(slow.timeout, Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_default_stages_and_job_stage() {
        let kdl = r#"
            pipeline "implicit"
            job "unit" {
                image "alpine"
                run "true"
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.stages, vec!["build", "test", "deploy"]);
        assert_eq!(pipeline.jobs[0].stage, "test");
    }

    #[test]
    fn test_detect_undeclared_stage() {
        let kdl = r#"
            pipeline "bad-stage"
            stages "build"

            job "deploy" stage="deploy" {
                image "alpine"
                run "echo deploy"
            }
        "#;

        let result = parse_pipeline(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_missing_pipeline_name() {
        let kdl = r#"
            job "unit" {
                image "alpine"
                run "true"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_missing_image() {
        let kdl = r#"
            pipeline "no-image"
            stages "build"
            job "compile" stage="build" {
                run "cargo build"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_invalid_allow_failure_value() {
        let kdl = r#"
            pipeline "bad-policy"
            stages "build"
            job "compile" stage="build" {
                image "alpine"
                allow-failure "sometimes"
                run "true"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            parse_pipeline("pipeline \"unterminated").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }
}
