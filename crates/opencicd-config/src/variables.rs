//! Variable interpolation for step commands and conditions.
//!
//! Supports variables like:
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Branch name
//! - `${job.id}`, `${job.name}`, `${job.repository}`
//! - `${run.id}`, `${run.actor}`, `${run.trigger}`, `${run.attempt}`
//! - `${step.name}`, `${step.index}`
//! - `${env.VAR_NAME}` - Run environment variable

use opencicd_core::run::Run;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub job: JobContext,
    pub run: RunContext,
    pub step: StepContext,
    pub env: BTreeMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub id: String,
    pub name: String,
    pub repository: String,
}

/// Run context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub actor: String,
    pub trigger: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is a valid regex")
});

const NAMESPACED: &[&str] = &[
    "git.sha",
    "git.short_sha",
    "git.branch",
    "job.id",
    "job.name",
    "job.repository",
    "run.id",
    "run.actor",
    "run.trigger",
    "run.attempt",
    "step.name",
    "step.index",
];

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for evaluating step `index` of `run`.
    pub fn for_step(run: &Run, index: usize) -> Self {
        let mut builder = VariableContextBuilder::new()
            .with_job(
                run.job_id.to_string(),
                run.job_name.clone(),
                run.repository.clone(),
            )
            .with_run(
                run.id.to_string(),
                run.trigger.actor.clone().unwrap_or_default(),
                run.trigger.kind.as_str(),
                run.attempt,
            );
        if let Some(sha) = &run.git.commit {
            builder = builder.with_git_sha(sha.clone());
        }
        if let Some(branch) = &run.git.branch {
            builder = builder.with_git_branch(branch.clone());
        }
        if let Some(step) = run.step(index) {
            builder = builder.with_step(step.name.clone(), index);
        }
        let mut ctx = builder.build();
        ctx.env = run.env.clone();
        if let Some(step) = run.step(index) {
            ctx.env.extend(step.env.clone());
        }
        ctx
    }

    /// Whether `var_name` names a variable this context can ever provide.
    pub fn is_known(var_name: &str) -> bool {
        NAMESPACED.contains(&var_name)
            || var_name
                .strip_prefix("env.")
                .is_some_and(|name| !name.is_empty())
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),

            ["job", "id"] => Some(self.job.id.clone()),
            ["job", "name"] => Some(self.job.name.clone()),
            ["job", "repository"] => Some(self.job.repository.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "actor"] => Some(self.run.actor.clone()),
            ["run", "trigger"] => Some(self.run.trigger.clone()),
            ["run", "attempt"] => Some(self.run.attempt.to_string()),

            ["step", "name"] => Some(self.step.name.clone()),
            ["step", "index"] => Some(self.step.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        self.interpolate_with(input, |name| format!("${{{}}}", name))
    }

    /// Interpolate every value of a map.
    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Interpolate, replacing unknown or unset variables with an empty string.
    pub fn interpolate_or_empty(&self, input: &str) -> String {
        self.interpolate_with(input, |_| String::new())
    }

    fn interpolate_with(&self, input: &str, missing: impl Fn(&str) -> String) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name).unwrap_or_else(|| missing(var_name))
            })
            .to_string()
    }

    /// Names of all `${...}` references in a string.
    pub fn references(input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_job(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        self.ctx.job.id = id.into();
        self.ctx.job.name = name.into();
        self.ctx.job.repository = repository.into();
        self
    }

    pub fn with_run(
        mut self,
        id: impl Into<String>,
        actor: impl Into<String>,
        trigger: impl Into<String>,
        attempt: u32,
    ) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.actor = actor.into();
        self.ctx.run.trigger = trigger.into();
        self.ctx.run.attempt = attempt;
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.step.name = name.into();
        self.ctx.step.index = index;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
