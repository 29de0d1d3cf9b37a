//! Variable interpolation for pipeline definitions.
//!
//! Images, script commands and env values may reference:
//! - `${git.sha}`, `${git.short_sha}`, `${git.branch}`, `${git.tag}`, `${git.ref}`
//! - `${git.message}`, `${git.author}`
//! - `${pipeline.id}` (the run id), `${pipeline.name}`
//! - `${stage.name}`, `${stage.index}`
//! - `${job.name}`, `${job.image}`
//! - `${env.VAR_NAME}`
//! - `${timestamp}`, `${date}`
//! - any single-part name set with [`VariableContext::set`]
//!
//! Unknown references are left untouched.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

/// All values available for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline: PipelineContext,
    pub stage: StageContext,
    pub job: JobContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables defined by the caller
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
    pub message: String,
    pub author: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub name: String,
    pub image: String,
}

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with git information read from the repository at `repo_path`,
    /// falling back to CI environment variables.
    pub fn from_git_repo(repo_path: &Path) -> Self {
        let mut ctx = Self::new();
        ctx.populate_git_from_repo(repo_path);
        if ctx.git.sha.is_empty() {
            ctx.populate_git_from_env();
        }
        ctx
    }

    /// Populate git context from environment variables set by CI systems.
    pub fn populate_git_from_env(&mut self) {
        let first = |names: &[&str]| names.iter().find_map(|n| std::env::var(n).ok());

        self.git.sha =
            first(&["STAGELINE_COMMIT_SHA", "CI_COMMIT_SHA", "GITHUB_SHA"]).unwrap_or_default();
        self.git.short_sha = self.git.sha.chars().take(7).collect();
        self.git.branch = first(&["STAGELINE_BRANCH", "CI_COMMIT_BRANCH", "GITHUB_REF_NAME"])
            .unwrap_or_default();
        self.git.tag = first(&["STAGELINE_TAG", "CI_COMMIT_TAG"]);
        self.git.ref_name = self
            .git
            .tag
            .clone()
            .unwrap_or_else(|| self.git.branch.clone());
        self.git.message = first(&["CI_COMMIT_MESSAGE"]).unwrap_or_default();
        self.git.author = first(&["CI_COMMIT_AUTHOR"]).unwrap_or_default();
    }

    /// Populate git context by running git in `repo_path`.
    pub fn populate_git_from_repo(&mut self, repo_path: &Path) {
        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
            if branch != "HEAD" {
                self.git.ref_name = branch.clone();
                self.git.branch = branch;
            }
        }

        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            self.git.ref_name = tag.clone();
            self.git.tag = Some(tag);
        }

        if let Some(message) = run_git(&["log", "-1", "--format=%s"]) {
            self.git.message = message;
        }

        if let Some(author) = run_git(&["log", "-1", "--format=%an"]) {
            self.git.author = author;
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Copy of this context scoped to one job.
    pub fn for_job(&self, stage: &str, stage_index: usize, job: &str, image: &str) -> Self {
        let mut ctx = self.clone();
        ctx.stage = StageContext {
            name: stage.to_string(),
            index: stage_index,
        };
        ctx.job = JobContext {
            name: job.to_string(),
            image: image.to_string(),
        };
        ctx
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),

            ["pipeline", "id"] => Some(self.pipeline.id.clone()),
            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["job", "name"] => Some(self.job.name.clone()),
            ["job", "image"] => Some(self.job.image.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Replace every `${...}` reference that resolves.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

/// Builder for creating VariableContext.
#[derive(Default)]
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if self.ctx.git.ref_name.is_empty() {
            self.ctx.git.ref_name = branch.clone();
        }
        self.ctx.git.branch = branch;
        self
    }

    pub fn with_git_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.ctx.git.ref_name = tag.clone();
        self.ctx.git.tag = Some(tag);
        self
    }

    pub fn with_pipeline(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.ctx.pipeline.id = id.into();
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}
