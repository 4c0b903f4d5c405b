//! Run scheduling for relay.
//!
//! Turns events into runs: the dispatcher gates jobs through their trigger
//! rules, the provisioner prepares checkouts and shared caches, the step
//! executor runs each job's steps fail-fast, and the reporter settles the
//! final status.

pub mod dispatcher;
pub mod fakes;
pub mod provisioner;
pub mod reporter;
pub mod steps;

pub use dispatcher::{DispatchReport, Dispatcher, RunEvent, RunHandle};
pub use provisioner::{CheckoutSpec, ProvisionReport, ResourceProvisioner};
pub use reporter::{RunReporter, RunSummary};
pub use steps::{RunEnv, StepExecutor};
