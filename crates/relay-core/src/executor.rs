//! Executor trait and command types.
//!
//! Executors run the shell payload of a single step. Sequencing, fail-fast
//! and provisioning live above this seam.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::Result;

/// A command to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Label used in logs (usually the step name).
    pub label: String,
    /// Shell script to run.
    pub script: String,
    /// Directory the process starts in.
    pub working_dir: PathBuf,
    /// Environment variables added to the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, script: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            label: label.into(),
            script: script.into(),
            working_dir,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal or timeout.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, in arrival order.
    pub output: Bytes,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Receives log lines while a command runs.
pub type LogSender = mpsc::UnboundedSender<LogLine>;

/// Trait for command executors.
///
/// A command that runs and exits non-zero is `Ok`; `Err` means the command
/// could not be run at all.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a command to completion, forwarding output lines to `logs`.
    async fn execute(&self, spec: CommandSpec, logs: Option<LogSender>) -> Result<CommandOutput>;
}
