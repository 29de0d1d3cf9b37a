//! Reference pipeline for Rust projects: build and test on the stable and
//! nightly toolchains, audit dependencies and check formatting.

use crate::ConfigResult;
use crate::pipeline::parse_pipeline;
use stageline_core::pipeline::Pipeline;

pub const BUILTIN_PIPELINE_KDL: &str = r#"pipeline "rust-toolchain"

stages "build" "test"

job "build-rust-latest" stage="build" {
    image "rust:latest"
    run "cargo build --verbose"
}

job "build-rust-nightly" stage="build" allow-failure=#true {
    image "rustlang/rust:nightly"
    run "cargo build --verbose"
}

job "test-rust-latest" stage="test" {
    image "rust:latest"
    run "cargo test --verbose"
}

job "test-rust-nightly" stage="test" allow-failure=#true {
    image "rustlang/rust:nightly"
    run "cargo test --verbose"
}

job "audit" stage="test" {
    image "rust:latest"
    run "cargo install cargo-audit"
    run "cargo build"
    run "cargo audit"
}

job "style" stage="test" {
    image "rust:latest"
    run "rustup component add rustfmt"
    run "cargo fmt --all -- --check"
}
"#;

/// Parse [`BUILTIN_PIPELINE_KDL`].
pub fn builtin_pipeline() -> ConfigResult<Pipeline> {
    parse_pipeline(BUILTIN_PIPELINE_KDL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageline_core::pipeline::AllowFailure;

    #[test]
    fn test_builtin_matches_reference_table() {
        let pipeline = builtin_pipeline().unwrap();
        assert_eq!(pipeline.stages, vec!["build", "test"]);

        let expected = [
            ("build-rust-latest", "build", "rust:latest", false),
            ("build-rust-nightly", "build", "rustlang/rust:nightly", true),
            ("test-rust-latest", "test", "rust:latest", false),
            ("test-rust-nightly", "test", "rustlang/rust:nightly", true),
            ("audit", "test", "rust:latest", false),
            ("style", "test", "rust:latest", false),
        ];
        assert_eq!(pipeline.jobs.len(), expected.len());

        for (job, (name, stage, image, allowed)) in pipeline.jobs.iter().zip(expected) {
            assert_eq!(job.name, name);
            assert_eq!(job.stage, stage);
            assert_eq!(job.image, image);
            assert_eq!(job.allow_failure, AllowFailure::from_bool(allowed), "{}", name);
        }
    }

    #[test]
    fn test_builtin_scripts() {
        let pipeline = builtin_pipeline().unwrap();
        assert_eq!(
            pipeline.job("build-rust-latest").unwrap().script,
            vec!["cargo build --verbose"]
        );
        assert_eq!(
            pipeline.job("audit").unwrap().script,
            vec!["cargo install cargo-audit", "cargo build", "cargo audit"]
        );
        assert_eq!(
            pipeline.job("style").unwrap().script.last().unwrap(),
            "cargo fmt --all -- --check"
        );
    }
}
