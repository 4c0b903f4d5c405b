//! `relay match`: which jobs would an event start.

use anyhow::{Context, Result};
use relay_core::{Event, Job, Workflow, select_jobs};
use serde::Serialize;
use std::path::Path;

use super::build_event;
use crate::EventArgs;

#[derive(Debug, Serialize)]
pub struct MatchReport {
    pub event: Event,
    pub jobs: Vec<JobMatch>,
}

#[derive(Debug, Serialize)]
pub struct JobMatch {
    pub job: String,
    pub matched: bool,
    /// Why the job would not run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub runs_on: Vec<String>,
}

fn rejection_reason(job: &Job, event: &Event) -> &'static str {
    if job.triggers.iter().all(|r| r.kind != event.kind) {
        "no trigger for this event kind"
    } else {
        "branch or paths do not match"
    }
}

pub fn evaluate_workflow(workflow: &Workflow, event: &Event) -> MatchReport {
    let selected = select_jobs(event, &workflow.jobs);
    let jobs = workflow
        .jobs
        .iter()
        .map(|job| {
            let matched = selected.iter().any(|j| j.name == job.name);
            JobMatch {
                job: job.name.clone(),
                matched,
                reason: (!matched).then(|| rejection_reason(job, event)),
                runs_on: job.runs_on.iter().cloned().collect(),
            }
        })
        .collect();
    MatchReport {
        event: event.clone(),
        jobs,
    }
}

pub fn show_matches(path: &Path, args: &EventArgs, json: bool) -> Result<()> {
    let workflow = relay_config::load_workflow(path)
        .with_context(|| format!("Failed to load workflow: {}", path.display()))?;
    let event = build_event(args)?;
    let report = evaluate_workflow(&workflow, &event);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} to '{}' with {} changed path(s)",
        event.kind,
        event.branch,
        event.changed_paths.len()
    );
    for m in &report.jobs {
        match m.reason {
            None => println!("  ✓ {}", m.job),
            Some(reason) => println!("  ⊘ {} ({})", m.job, reason),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
        workflow "ci"
        on "push" branches="main" paths="**/*.py"
        job "e2e_gpu" runs-on="gpu" {
            step "test" { run "pytest -s -x tests/verl" }
        }
        job "docs" {
            on "push" branches="main" paths="docs/**"
            step "build" { run "make docs" }
        }
    "#;

    #[test]
    fn test_evaluate_workflow() {
        let workflow = relay_config::parse_workflow(WORKFLOW).unwrap();
        let report = evaluate_workflow(&workflow, &Event::push("main", ["tests/ray/test_rvdz.py"]));

        assert_eq!(report.jobs.len(), 2);
        assert!(report.jobs[0].matched);
        assert_eq!(report.jobs[0].runs_on, vec!["gpu"]);
        assert!(!report.jobs[1].matched);
        assert_eq!(report.jobs[0].reason, None);
        assert_eq!(report.jobs[1].reason, Some("branch or paths do not match"));
    }

    #[test]
    fn test_report_serializes() {
        let workflow = relay_config::parse_workflow(WORKFLOW).unwrap();
        let report = evaluate_workflow(&workflow, &Event::pull_request("main", ["docs/index.md"]));
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["event"]["kind"], "pull_request");
        assert_eq!(value["jobs"][1]["job"], "docs");
        assert_eq!(value["jobs"][1]["matched"], false);
        assert_eq!(value["jobs"][1]["reason"], "no trigger for this event kind");
        assert!(value["jobs"][0].get("reason").is_some());
    }
}
