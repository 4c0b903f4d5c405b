//! Workflow configuration parsing.
//!
//! ```kdl
//! workflow "e2e_gpu"
//! vars { suite "tests/verl" }
//!
//! on "push" {
//!     branches "main"
//!     paths "**/*.py" ".github/workflows/e2e_gpu.yml"
//! }
//!
//! job "e2e_gpu" runs-on="self-hosted" timeout="1h" {
//!     runs-on "gpu"
//!     step "checkout" { uses "checkout" fetch-depth=0 }
//!     step "install" { run "pip3 install -e .[test]" }
//!     step "fetch dataset" {
//!         cache key="verl-data" path="~/verl-data"
//!         run "git clone --depth 1 https://example.invalid/verl-data ~/verl-data"
//!     }
//!     step "verl tests" { run "pytest -s -x ${suite}" }
//! }
//! ```

use crate::kdl_ext::*;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use relay_core::{EventKind, Job, Step, StepAction, TriggerRule, Workflow};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Read and parse a workflow file.
pub fn load_workflow(path: impl AsRef<Path>) -> ConfigResult<Workflow> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

/// Parse a workflow configuration from KDL text.
pub fn parse_workflow(kdl: &str) -> ConfigResult<Workflow> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut triggers = Vec::new();
    let mut vars = BTreeMap::new();
    let mut jobs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "workflow" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workflow name".to_string()))?;
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "vars" => {
                vars.extend(get_env_block(node));
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("workflow name".to_string()));
    }

    let mut seen = HashSet::new();
    for job in &mut jobs {
        if !seen.insert(job.name.clone()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
        // Jobs without their own rules inherit the workflow-level ones.
        if job.triggers.is_empty() {
            job.triggers = triggers.clone();
        }
        for (name, value) in &vars {
            job.vars.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }

    Ok(Workflow { name, jobs })
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<TriggerRule> {
    let kind_name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("trigger kind".to_string()))?;

    let kind = match kind_name.as_str() {
        "push" => EventKind::Push,
        "pull_request" => EventKind::PullRequest,
        other => {
            return Err(ConfigError::invalid(
                "trigger kind",
                format!("unknown trigger kind: {}", other),
            ));
        }
    };

    let mut branches = get_string_list_prop(node, "branches");
    if branches.is_empty() {
        branches.push("*".to_string());
    }

    Ok(TriggerRule::new(kind)
        .with_branches(branches)
        .with_paths(get_string_list_prop(node, "paths")))
}

fn parse_job(node: &KdlNode) -> ConfigResult<Job> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut job = Job::new(name.clone());
    job.timeout = get_duration_prop(node, "timeout")?;
    job.runs_on.extend(get_string_list_prop(node, "runs-on"));

    let mut step_names = HashSet::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "on" => job.triggers.push(parse_trigger(child)?),
                "env" => job.env.extend(get_env_block(child)),
                "vars" => job.vars.extend(get_env_block(child)),
                "step" => {
                    let step = parse_step(child, &name)?;
                    if !step_names.insert(step.name.clone()) {
                        return Err(ConfigError::Duplicate(format!(
                            "step '{}' in job '{}'",
                            step.name, name
                        )));
                    }
                    job.steps.push(step);
                }
                _ => {}
            }
        }
    }

    if job.steps.is_empty() {
        return Err(ConfigError::MissingField(format!("steps for job '{}'", name)));
    }

    Ok(job)
}

fn parse_step(node: &KdlNode, job: &str) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("step name in job '{}'", job)))?;

    let mut commands = Vec::new();
    let mut uses: Option<&KdlNode> = None;
    let mut cache: Option<&KdlNode> = None;
    let mut working_directory = None;
    let mut env = Default::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => commands.extend(get_first_string_arg(child)),
                "uses" => uses = Some(child),
                "cache" => cache = Some(child),
                "working-directory" => working_directory = get_first_string_arg(child),
                "env" => env = get_env_block(child),
                _ => {}
            }
        }
    }

    let field = |f: &str| format!("{} of step '{}'", f, name);

    let action = match (uses, commands.is_empty(), cache) {
        (Some(_), false, _) => {
            return Err(ConfigError::invalid(
                field("action"),
                "a step takes either `run` or `uses`, not both",
            ));
        }
        (None, true, _) => {
            return Err(ConfigError::MissingField(field("`run` or `uses`")));
        }
        (Some(_), true, Some(_)) => {
            return Err(ConfigError::invalid(
                field("cache"),
                "`cache` needs a `run` command to populate it",
            ));
        }
        (Some(uses), true, None) => parse_uses(uses, &name)?,
        (None, false, Some(cache)) => StepAction::Cache {
            key: get_string_prop(cache, "key")
                .ok_or_else(|| ConfigError::MissingField(field("cache key")))?,
            path: get_string_prop(cache, "path")
                .ok_or_else(|| ConfigError::MissingField(field("cache path")))?,
            command: commands.join(" && "),
        },
        (None, false, None) => StepAction::Run {
            command: commands.join(" && "),
        },
    };

    Ok(Step {
        name,
        action,
        working_directory,
        env,
        timeout: get_duration_prop(node, "timeout")?,
    })
}

fn parse_uses(node: &KdlNode, step: &str) -> ConfigResult<StepAction> {
    let action = get_first_string_arg(node).unwrap_or_default();
    match action.as_str() {
        "checkout" => {
            let depth = get_u64_prop(node, "fetch-depth")?.unwrap_or(0);
            let fetch_depth = u32::try_from(depth)
                .map_err(|_| ConfigError::invalid("fetch-depth", "value too large"))?;
            Ok(StepAction::Checkout {
                repository: get_string_prop(node, "repository"),
                fetch_depth,
            })
        }
        other => Err(ConfigError::invalid(
            format!("uses of step '{}'", step),
            format!("unknown action: {}", other),
        )),
    }
}
