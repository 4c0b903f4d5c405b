//! Run instances, step results and the run state machine.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::event::Event;
use crate::job::{Job, Step};
use crate::{Error, Result, RunId};

/// Lifecycle of a run.
///
/// `Pending -> Running -> {Succeeded | Failed}`, or `Pending -> Skipped`
/// when no trigger rule accepted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum RunStatus {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("skipped")]
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Skipped
        )
    }

    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Skipped)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    /// Non-zero exit, or a provisioning failure.
    Failed { message: String },
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Never started (earlier failure or cancellation).
    Skipped { reason: String },
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepStatus::Skipped { .. })
    }

    /// Whether this outcome halts the remaining steps.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed { .. } | StepStatus::TimedOut)
    }
}

/// Result of one step in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    /// Process exit code; `None` when the step never ran or was killed.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Combined stdout and stderr.
    pub output: Bytes,
    pub started_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn skipped(step: Step, reason: impl Into<String>) -> Self {
        Self {
            step,
            status: StepStatus::Skipped {
                reason: reason.into(),
            },
            exit_code: None,
            duration: Duration::ZERO,
            output: Bytes::new(),
            started_at: None,
        }
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// A step exited non-zero or timed out.
    Step { step: String, exit_code: Option<i32> },
    /// A checkout or cache step could not provision its resource.
    Provisioning { step: String, message: String },
    /// The run was cancelled before all steps ran.
    Cancelled,
}

/// One execution of a job in response to one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job: Job,
    pub event: Event,
    pub status: RunStatus,
    /// One entry per job step once the run has executed, in step order.
    pub step_results: Vec<StepResult>,
    pub failure: Option<FailureCause>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(job: Job, event: Event) -> Self {
        Self {
            id: RunId::new(),
            job,
            event,
            status: RunStatus::Pending,
            step_results: Vec::new(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// A run recorded for audit when the trigger filter rejected the event.
    pub fn skipped(job: Job, event: Event) -> Self {
        let mut run = Self::new(job, event);
        run.status = RunStatus::Skipped;
        run.finished_at = Some(run.created_at);
        run
    }

    /// Move to `to`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, to: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        match to {
            RunStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// The first step that failed or timed out.
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.status.is_failure())
    }

    /// Why a failed run failed, as an error. `None` unless the run failed.
    pub fn error(&self) -> Option<Error> {
        if self.status != RunStatus::Failed {
            return None;
        }
        Some(match &self.failure {
            Some(FailureCause::Step { step, exit_code }) => {
                let timed_out = self
                    .step_results
                    .iter()
                    .any(|r| &r.step.name == step && r.status == StepStatus::TimedOut);
                if timed_out {
                    Error::Timeout(format!("step '{}' of job '{}'", step, self.job.name))
                } else {
                    Error::StepFailed {
                        step: step.clone(),
                        exit_code: *exit_code,
                    }
                }
            }
            Some(FailureCause::Provisioning { step, message }) => {
                Error::provisioning(step.as_str(), message)
            }
            Some(FailureCause::Cancelled) => Error::Cancelled,
            None => Error::Internal(format!("run {} failed without a recorded cause", self.id)),
        })
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}

/// A prerequisite shared across runs, such as a dataset directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResource {
    pub key: String,
    pub location: PathBuf,
    pub populated: bool,
}

impl CachedResource {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            location: PathBuf::new(),
            populated: false,
        }
    }
}
