//! In-memory executor for tests and dry runs.
//!
//! `FakeExecutor` records every command it is asked to run and answers from
//! a small rule table instead of spawning processes. A successful cache
//! command creates the directory named in `RELAY_CACHE_PATH`, as a real
//! populate command would.

use async_trait::async_trait;
use bytes::Bytes;
use relay_core::Result;
use relay_core::executor::{CommandOutput, CommandSpec, Executor, LogLine, LogSender, LogStream};

use crate::provisioner::CACHE_PATH_ENV;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Behavior {
    Exit(i32),
    Hang,
    /// Exit 0 without creating the cache location.
    LeaveEmpty,
}

/// Executor double: commands succeed unless a rule says otherwise.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    rules: Vec<(String, Behavior)>,
    delay: Duration,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose script contains `pattern` exit with `code`.
    pub fn fail_on(mut self, pattern: impl Into<String>, code: i32) -> Self {
        self.rules.push((pattern.into(), Behavior::Exit(code)));
        self
    }

    /// Commands whose script contains `pattern` run until their timeout.
    pub fn hang_on(mut self, pattern: impl Into<String>) -> Self {
        self.rules.push((pattern.into(), Behavior::Hang));
        self
    }

    /// Commands whose script contains `pattern` succeed but write nothing.
    pub fn leave_empty(mut self, pattern: impl Into<String>) -> Self {
        self.rules.push((pattern.into(), Behavior::LeaveEmpty));
        self
    }

    /// Every command takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Commands received so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of received commands whose script contains `pattern`.
    pub fn call_count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.script.contains(pattern))
            .count()
    }

    fn behavior(&self, script: &str) -> Option<&Behavior> {
        self.rules
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
            .map(|(_, b)| b)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn execute(&self, spec: CommandSpec, logs: Option<LogSender>) -> Result<CommandOutput> {
        let start = Instant::now();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());

        let line = format!("$ {}", spec.script);
        if let Some(logs) = &logs {
            let _ = logs.send(LogLine::new(LogStream::Stdout, line.clone()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let (exit_code, timed_out) = match self.behavior(&spec.script) {
            None => {
                if let Some(location) = spec.env.get(CACHE_PATH_ENV) {
                    tokio::fs::create_dir_all(location).await?;
                }
                (Some(0), false)
            }
            Some(Behavior::LeaveEmpty) => (Some(0), false),
            Some(Behavior::Exit(code)) => (Some(*code), false),
            Some(Behavior::Hang) => {
                if let Some(limit) = spec.timeout {
                    tokio::time::sleep(limit).await;
                }
                (None, true)
            }
        };

        Ok(CommandOutput {
            exit_code,
            output: Bytes::from(format!("{}\n", line)),
            timed_out,
            duration: start.elapsed(),
        })
    }
}
