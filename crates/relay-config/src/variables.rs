//! Variable interpolation for step commands and environment values.
//!
//! Supports variables like:
//! - `${event.kind}` - `push` or `pull_request`
//! - `${event.branch}` - Target branch of the event
//! - `${event.sha}` - Head commit, when known
//! - `${run.id}` - Run ID
//! - `${run.workspace}` - Run-scoped workspace directory
//! - `${job.name}` - Job name
//! - `${step.name}` - Current step name
//! - `${step.index}` - Current step index (0-based)
//! - `${cache.key}` / `${cache.path}` - Resource a cache step populates
//! - `${env.VAR_NAME}` - Environment variable
//! - `${name}` - Workflow or job `vars`
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)

use regex::Regex;
use relay_core::Event;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub event: EventContext,
    pub run: RunContext,
    pub job: JobContext,
    pub step: StepContext,
    pub cache: CacheContext,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Workflow and job `vars`
    pub custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub kind: String,
    pub branch: String,
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub workspace: String,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CacheContext {
    pub key: Option<String>,
    pub path: Option<String>,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with the event fields filled in.
    pub fn for_event(event: &Event) -> Self {
        let mut ctx = Self::new();
        ctx.event.kind = event.kind.to_string();
        ctx.event.branch = event.branch.clone();
        ctx.event.sha = event.sha.clone();
        ctx
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    /// Expose the resource a cache step is about to populate.
    pub fn set_cache(&mut self, key: impl Into<String>, path: impl Into<String>) {
        self.cache.key = Some(key.into());
        self.cache.path = Some(path.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["event", "kind"] => Some(self.event.kind.clone()),
            ["event", "branch"] => Some(self.event.branch.clone()),
            ["event", "sha"] => self.event.sha.clone(),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "workspace"] => Some(self.run.workspace.clone()),

            ["job", "name"] => Some(self.job.name.clone()),

            ["step", "name"] => Some(self.step.name.clone()),
            ["step", "index"] => Some(self.step.index.to_string()),

            ["cache", "key"] => self.cache.key.clone(),
            ["cache", "path"] => self.cache.path.clone(),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
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

    pub fn with_event(mut self, event: &Event) -> Self {
        self.ctx.event = VariableContext::for_event(event).event;
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, workspace: impl Into<String>) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.workspace = workspace.into();
        self
    }

    pub fn with_job(mut self, name: impl Into<String>) -> Self {
        self.ctx.job.name = name.into();
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

    pub fn with_vars(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.ctx
            .custom
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}
