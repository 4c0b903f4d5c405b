//! Core domain types and traits for the relay job dispatcher.
//!
//! This crate contains:
//! - Run identifiers
//! - Repository events and the trigger predicate
//! - Job, step and run definitions with the run state machine
//! - The executor trait used to run step commands

pub mod error;
pub mod event;
pub mod executor;
pub mod id;
pub mod job;
pub mod run;
pub mod trigger;

pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use id::RunId;
pub use job::{Job, Step, StepAction, Workflow};
pub use run::{CachedResource, FailureCause, Run, RunStatus, StepResult, StepStatus};
pub use trigger::{TriggerRule, evaluate, glob_match, select_jobs};
