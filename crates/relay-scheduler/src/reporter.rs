//! Settles a run's terminal status from its step results.

use relay_core::{FailureCause, Run, RunStatus, StepResult, StepStatus};
use std::fmt;
use tracing::{info, warn};

/// Turns executed runs into their terminal state.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunReporter;

impl RunReporter {
    pub fn new() -> Self {
        Self
    }

    /// Set the terminal status of `run`.
    ///
    /// A run succeeds iff every step result succeeded. Anything else fails,
    /// with the first failing step recorded as the cause. Runs already in a
    /// terminal state are returned unchanged.
    pub fn finalize(&self, mut run: Run) -> Run {
        if run.status.is_terminal() {
            return run;
        }
        if run.status == RunStatus::Pending {
            // Pending -> Running is always allowed.
            let _ = run.transition(RunStatus::Running);
        }

        let succeeded = run.step_results.len() == run.job.steps.len()
            && run.step_results.iter().all(|r| r.status.is_success());

        let to = if succeeded {
            RunStatus::Succeeded
        } else {
            run.failure = Some(failure_cause(&run.step_results));
            RunStatus::Failed
        };

        if let Err(e) = run.transition(to) {
            warn!(run_id = %run.id, error = %e, "Could not finalize run");
            return run;
        }

        match &run.failure {
            None => info!(run_id = %run.id, job = %run.job.name, "Run succeeded"),
            Some(cause) => warn!(run_id = %run.id, job = %run.job.name, ?cause, "Run failed"),
        }
        run
    }

    pub fn summary<'a>(&self, run: &'a Run) -> RunSummary<'a> {
        RunSummary { run }
    }
}

fn failure_cause(results: &[StepResult]) -> FailureCause {
    match results.iter().find(|r| r.status.is_failure()) {
        Some(result) if result.step.is_provisioning() => FailureCause::Provisioning {
            step: result.step.name.clone(),
            message: match &result.status {
                StepStatus::Failed { message } => message.clone(),
                other => format!("{:?}", other),
            },
        },
        Some(result) => FailureCause::Step {
            step: result.step.name.clone(),
            exit_code: result.exit_code,
        },
        None => FailureCause::Cancelled,
    }
}

/// Plain-text report of a run: one line per step, then the output of the
/// first failing step.
pub struct RunSummary<'a> {
    run: &'a Run,
}

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.run;
        writeln!(f, "{} {} [{}]", run.job.name, run.id, run.status)?;

        for result in &run.step_results {
            let (mark, detail) = match &result.status {
                StepStatus::Succeeded => ("✓", String::new()),
                StepStatus::Failed { message } => ("✗", format!(" ({})", message)),
                StepStatus::TimedOut => ("✗", " (timed out)".to_string()),
                StepStatus::Skipped { reason } => ("⊘", format!(" (skipped: {})", reason)),
            };
            let exit = result
                .exit_code
                .map(|c| format!(" exit={}", c))
                .unwrap_or_default();
            if result.status.is_skipped() {
                writeln!(f, "  {} {}{}", mark, result.step.name, detail)?;
            } else {
                writeln!(
                    f,
                    "  {} {}{} {:.1}s{}",
                    mark,
                    result.step.name,
                    exit,
                    result.duration.as_secs_f64(),
                    detail
                )?;
            }
        }

        if let Some(cause) = &run.failure {
            match cause {
                FailureCause::Step { step, .. } | FailureCause::Provisioning { step, .. } => {
                    writeln!(f, "failed at '{}'", step)?;
                }
                FailureCause::Cancelled => writeln!(f, "cancelled")?,
            }
        }

        if let Some(failed) = run.first_failure() {
            let output = failed.output_lossy();
            if !output.trim().is_empty() {
                writeln!(f, "--- output of '{}' ---", failed.step.name)?;
                write!(f, "{}", output)?;
                if !output.ends_with('\n') {
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}
