//! Local workflow execution command.

use anyhow::{Context, Result};
use relay_config::{EngineConfig, load_engine_config, load_workflow};
use relay_core::executor::LogStream;
use relay_core::{Error, Run, RunStatus, StepStatus};
use relay_executor::ShellExecutor;
use relay_scheduler::{Dispatcher, RunEvent, RunReporter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::build_event;
use crate::{EngineArgs, EventArgs};

/// Engine settings from the config file (if any), then command-line flags.
pub fn engine_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => load_engine_config(path)
            .with_context(|| format!("Failed to load engine config: {}", path.display()))?,
        None => EngineConfig::default(),
    };

    config.labels.extend(args.labels.iter().cloned());
    if let Some(root) = &args.workspace_root {
        config.workspace_root = root.clone();
    }
    if let Some(root) = &args.cache_root {
        config.cache_root = root.clone();
    }
    if let Some(repository) = &args.repository {
        config.repository = Some(repository.clone());
    }
    if let Some(n) = args.max_concurrent_runs {
        anyhow::ensure!(n > 0, "--max-concurrent-runs must be positive");
        config.max_concurrent_runs = n;
    }
    if args.step_timeout.is_some() {
        config.default_step_timeout = args.step_timeout;
    }
    config.keep_workspaces |= args.keep_workspaces;
    config.audit_skipped |= args.audit_skipped;
    Ok(config)
}

/// Run the jobs `event` starts, using the local shell.
pub async fn run_local(
    workflow_path: &Path,
    event_args: &EventArgs,
    engine_args: &EngineArgs,
    only: &[String],
) -> Result<()> {
    let mut workflow = load_workflow(workflow_path)
        .with_context(|| format!("Failed to load workflow: {}", workflow_path.display()))?;

    if !only.is_empty() {
        workflow.retain_jobs(only)?;
    }

    let mut config = engine_config(engine_args)?;
    if config.repository.is_none() {
        let root = repository_root(workflow_path).await?;
        config.repository = Some(root.to_string_lossy().into_owned());
    }
    let event = build_event(event_args)?;

    println!("Workflow: {}", workflow.name);
    println!(
        "Event: {} to '{}' ({} changed paths)",
        event.kind,
        event.branch,
        event.changed_paths.len()
    );

    let executor = Arc::new(ShellExecutor::with_shell(config.shell.clone()));
    let (tx, rx) = mpsc::channel(256);
    let dispatcher = Dispatcher::new(workflow, executor, config).with_events(tx);

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling runs after the current step");
            shutdown.cancel();
        }
    });

    let printer = tokio::spawn(print_events(rx));
    let report = dispatcher.dispatch(&event).await;
    drop(dispatcher);
    printer.await.context("Event printer failed")?;

    let reporter = RunReporter::new();
    println!("\n--- Summary ---");
    if report.runs.is_empty() && report.unschedulable.is_empty() {
        println!("No jobs matched this event");
    }
    for run in &report.runs {
        print!("{}", reporter.summary(run));
    }
    let failures: Vec<Error> = report.runs.iter().filter_map(Run::error).collect();
    for run in &report.skipped {
        println!("{} [{}]", run.job.name, RunStatus::Skipped);
    }
    for err in failures
        .iter()
        .chain(&report.unschedulable)
        .chain(&report.errors)
    {
        match err {
            Error::Infrastructure { job, missing } => {
                println!("{} [unschedulable] missing labels: {}", job, missing.join(", "));
            }
            other => println!("error: {}", other),
        }
    }

    if report.success() {
        println!("\n✓ All runs succeeded");
        Ok(())
    } else {
        anyhow::bail!("One or more runs failed");
    }
}

/// The git work tree containing the workflow file, or its directory when it
/// is not inside one.
async fn repository_root(workflow_path: &Path) -> Result<PathBuf> {
    let dir = workflow_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("Failed to resolve workflow directory")?;

    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(&dir)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            let top = String::from_utf8_lossy(&out.stdout).trim().to_string();
            Ok(PathBuf::from(top))
        }
        _ => {
            debug!(dir = %dir.display(), "Workflow is not inside a git work tree");
            Ok(dir)
        }
    }
}

async fn print_events(mut rx: mpsc::Receiver<RunEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::RunStarted { run_id, job } => {
                println!("▶ Run {} of '{}' started", run_id, job);
            }
            RunEvent::StepStarted { step, .. } => {
                println!("▶ Step '{}' started", step);
            }
            RunEvent::StepOutput { step, line, .. } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", step, stream_marker, line.content);
            }
            RunEvent::StepCompleted { step, status, .. } => match status {
                StepStatus::Succeeded => println!("✓ Step '{}' completed successfully\n", step),
                StepStatus::Failed { message } => println!("✗ Step '{}' failed: {}\n", step, message),
                StepStatus::TimedOut => println!("✗ Step '{}' timed out\n", step),
                StepStatus::Skipped { reason } => println!("⊘ Step '{}' skipped: {}\n", step, reason),
            },
            RunEvent::RunCompleted { job, status, .. } => {
                println!("--- Run of '{}' {} ---", job, status);
            }
        }
    }
}
