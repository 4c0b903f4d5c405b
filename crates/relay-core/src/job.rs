//! Job and step definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::trigger::TriggerRule;
use crate::{Error, Result};

/// A set of jobs loaded from one workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub jobs: Vec<Job>,
}

impl Workflow {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Keep only the named jobs, in declaration order. Every name must exist.
    pub fn retain_jobs(&mut self, names: &[String]) -> Result<()> {
        if let Some(missing) = names.iter().find(|n| self.job(n).is_none()) {
            return Err(Error::NotFound(format!(
                "job '{}' in workflow '{}'",
                missing, self.name
            )));
        }
        self.jobs.retain(|j| names.contains(&j.name));
        Ok(())
    }
}

/// A named sequence of steps gated by trigger rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job name, unique within a workflow.
    pub name: String,
    /// Runner labels this job needs (e.g. "self-hosted", "gpu").
    pub runs_on: BTreeSet<String>,
    /// Rules that start this job.
    pub triggers: Vec<TriggerRule>,
    /// Steps, executed strictly in order.
    pub steps: Vec<Step>,
    /// Job-wide environment variables.
    pub env: BTreeMap<String, String>,
    /// Default timeout for each step of this job.
    pub timeout: Option<Duration>,
    /// Values for bare `${name}` references in commands and env values.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runs_on: BTreeSet::new(),
            triggers: Vec::new(),
            steps: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
            vars: BTreeMap::new(),
        }
    }

    pub fn with_trigger(mut self, rule: TriggerRule) -> Self {
        self.triggers.push(rule);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.runs_on.insert(label.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Labels from `runs_on` that `available` does not provide.
    pub fn missing_labels(&self, available: &BTreeSet<String>) -> Vec<String> {
        self.runs_on.difference(available).cloned().collect()
    }
}

/// One step of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Human-readable label.
    pub name: String,
    /// What this step does.
    pub action: StepAction,
    /// Directory to run in; relative paths resolve against the current one.
    pub working_directory: Option<String>,
    /// Step-specific environment variables.
    pub env: BTreeMap<String, String>,
    /// Overrides the job timeout.
    pub timeout: Option<Duration>,
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepAction {
    /// Run a shell script.
    Run { command: String },
    /// Clone the repository into a run-scoped directory.
    Checkout {
        /// Repository URL or path; `None` means the repository the event came from.
        repository: Option<String>,
        /// 0 fetches full history.
        fetch_depth: u32,
    },
    /// Populate a shared cached resource if it is not already present.
    Cache {
        key: String,
        path: String,
        command: String,
    },
}

impl Step {
    fn with_action(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            working_directory: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_action(
            name,
            StepAction::Run {
                command: command.into(),
            },
        )
    }

    pub fn checkout(name: impl Into<String>) -> Self {
        Self::with_action(
            name,
            StepAction::Checkout {
                repository: None,
                fetch_depth: 0,
            },
        )
    }

    pub fn cache(
        name: impl Into<String>,
        key: impl Into<String>,
        path: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self::with_action(
            name,
            StepAction::Cache {
                key: key.into(),
                path: path.into(),
                command: command.into(),
            },
        )
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether this step goes through the resource provisioner.
    pub fn is_provisioning(&self) -> bool {
        !matches!(self.action, StepAction::Run { .. })
    }

    /// The payload shown to users for this step.
    pub fn command(&self) -> String {
        match &self.action {
            StepAction::Run { command } => command.clone(),
            StepAction::Checkout {
                repository,
                fetch_depth,
            } => {
                let repo = repository.as_deref().unwrap_or("<event repository>");
                if *fetch_depth == 0 {
                    format!("checkout {}", repo)
                } else {
                    format!("checkout {} (depth {})", repo, fetch_depth)
                }
            }
            StepAction::Cache { key, path, command } => {
                format!("cache {} at {}: {}", key, path, command)
            }
        }
    }
}
