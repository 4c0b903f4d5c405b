//! Repository events that may start a run.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Error, Result};

/// Kind of repository event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[display("push")]
    Push,
    #[display("pull_request")]
    PullRequest,
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(Error::InvalidInput(format!("unknown event kind: {}", other))),
        }
    }
}

/// A push or pull request against a target branch.
///
/// Events are values: once built they are only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Target branch (the pushed branch, or the base branch of a pull request).
    pub branch: String,
    /// Repository-relative paths touched by the event.
    pub changed_paths: BTreeSet<String>,
    /// Head commit, when known.
    pub sha: Option<String>,
}

impl Event {
    pub fn new<I, S>(kind: EventKind, branch: impl Into<String>, changed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            branch: branch.into(),
            changed_paths: changed_paths.into_iter().map(Into::into).collect(),
            sha: None,
        }
    }

    pub fn push<I, S>(branch: impl Into<String>, changed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(EventKind::Push, branch, changed_paths)
    }

    pub fn pull_request<I, S>(branch: impl Into<String>, changed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(EventKind::PullRequest, branch, changed_paths)
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }
}

/// Parse the output of `git diff --name-only` into a set of changed paths.
pub fn changed_paths_from_diff(diff: &str) -> BTreeSet<String> {
    diff.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
