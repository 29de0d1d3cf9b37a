//! Loading definitions from disk.

use crate::gitlab::parse_gitlab_ci;
use crate::pipeline::parse_pipeline;
use crate::{ConfigError, ConfigResult};
use stageline_core::pipeline::Pipeline;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Definition files looked up in a workspace, in order of preference.
pub const PIPELINE_FILE_NAMES: [&str; 2] = ["stageline.kdl", ".gitlab-ci.yml"];

/// Load a definition, choosing the parser from the file extension.
pub fn load_pipeline(path: &Path) -> ConfigResult<Pipeline> {
    let content = std::fs::read_to_string(path)?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

    debug!(path = %path.display(), "Loading pipeline definition");
    match extension {
        "kdl" => parse_pipeline(&content),
        "yml" | "yaml" => parse_gitlab_ci(&content, &name_from_path(path)),
        other => Err(ConfigError::UnsupportedFormat(format!(
            "{} (extension '{}')",
            path.display(),
            other
        ))),
    }
}

/// Find the first known definition file in `dir`.
pub fn discover_pipeline(dir: &Path) -> Option<PathBuf> {
    PIPELINE_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// YAML files carry no pipeline name; derive one from the file stem.
fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_start_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "pipeline".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_kdl_and_yaml() {
        let dir = tempfile::tempdir().unwrap();

        let kdl_path = dir.path().join("stageline.kdl");
        fs::write(&kdl_path, crate::BUILTIN_PIPELINE_KDL).unwrap();
        let from_kdl = load_pipeline(&kdl_path).unwrap();
        assert_eq!(from_kdl.name, "rust-toolchain");

        let yaml_path = dir.path().join(".gitlab-ci.yml");
        fs::write(
            &yaml_path,
            "build:\n  stage: build\n  image: alpine\n  script: make\n",
        )
        .unwrap();
        let from_yaml = load_pipeline(&yaml_path).unwrap();
        assert_eq!(from_yaml.name, "gitlab-ci");
        assert_eq!(from_yaml.jobs[0].stage, "build");
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, "{}").unwrap();
        assert!(matches!(
            load_pipeline(&path).unwrap_err(),
            ConfigError::UnsupportedFormat(_)
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_pipeline(&dir.path().join("stageline.kdl")).unwrap_err(),
            ConfigError::Io(_)
        ));
    }

    #[test]
    fn test_discover_prefers_kdl() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_pipeline(dir.path()).is_none());

        fs::write(dir.path().join(".gitlab-ci.yml"), "").unwrap();
        assert_eq!(
            discover_pipeline(dir.path()).unwrap(),
            dir.path().join(".gitlab-ci.yml")
        );

        fs::write(dir.path().join("stageline.kdl"), "").unwrap();
        assert_eq!(
            discover_pipeline(dir.path()).unwrap(),
            dir.path().join("stageline.kdl")
        );
    }
}
