//! Trigger rules: which events start which jobs.
//!
//! A rule matches an event when the event kind equals the rule kind, the
//! branch matches one of the rule's branches, and (if the rule has any path
//! globs) at least one changed path matches at least one glob.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::event::{Event, EventKind};
use crate::job::Job;

/// Branch and path filter for one event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub kind: EventKind,
    /// Branch names. Entries containing `*` are patterns.
    pub branches: BTreeSet<String>,
    /// Path globs. Empty means the rule does not filter on paths.
    pub path_globs: Vec<String>,
}

impl TriggerRule {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            branches: BTreeSet::new(),
            path_globs: Vec::new(),
        }
    }

    pub fn with_branches<I, S>(mut self, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches.extend(branches.into_iter().map(Into::into));
        self
    }

    pub fn with_paths<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_globs.extend(globs.into_iter().map(Into::into));
        self
    }

    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branches.iter().any(|pattern| {
            if pattern.contains('*') {
                wildcard_match(pattern, branch)
            } else {
                pattern == branch
            }
        })
    }

    pub fn matches_paths(&self, paths: &BTreeSet<String>) -> bool {
        if self.path_globs.is_empty() {
            return true;
        }
        paths
            .iter()
            .any(|path| self.path_globs.iter().any(|glob| glob_match(glob, path)))
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.kind == event.kind
            && self.matches_branch(&event.branch)
            && self.matches_paths(&event.changed_paths)
    }
}

/// Whether any rule in `rules` accepts `event`.
pub fn evaluate(event: &Event, rules: &[TriggerRule]) -> bool {
    rules.iter().any(|rule| rule.matches(event))
}

/// Jobs started by `event`, in declaration order.
///
/// A job whose rules match more than once is still returned once.
pub fn select_jobs<'a>(event: &Event, jobs: &'a [Job]) -> Vec<&'a Job> {
    let mut seen = HashSet::new();
    jobs.iter()
        .filter(|job| evaluate(event, &job.triggers))
        .filter(|job| seen.insert(job.name.as_str()))
        .collect()
}

/// Match a `/`-separated path against a glob.
///
/// `**` as a whole segment spans any number of segments, `*` and `?` stay
/// inside one segment. Matching is case-sensitive.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, path_rest)) => {
                wildcard_match(head, segment) && match_segments(rest, path_rest)
            }
            None => false,
        },
    }
}

/// `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();

    let mut pi = 0usize;
    let mut vi = 0usize;
    let mut backtrack: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, vi));
            pi += 1;
        } else if let Some((star_pi, star_vi)) = backtrack {
            pi = star_pi + 1;
            vi = star_vi + 1;
            backtrack = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
