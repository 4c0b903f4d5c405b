//! Engine configuration parsing.

use crate::kdl_ext::*;
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for the local engine that runs jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Parent directory of run-scoped checkouts.
    pub workspace_root: PathBuf,
    /// Parent directory for cached resources given as relative paths.
    pub cache_root: PathBuf,
    /// Labels this runner provides, matched against `runs-on`.
    pub labels: BTreeSet<String>,
    /// Runs executing at the same time.
    pub max_concurrent_runs: usize,
    /// Timeout for steps that do not set one; `None` waits forever.
    pub default_step_timeout: Option<Duration>,
    /// Shell used for `run` scripts.
    pub shell: String,
    /// Record jobs rejected by the trigger filter as skipped runs.
    pub audit_skipped: bool,
    /// Keep run-scoped workspaces after the run finishes.
    pub keep_workspaces: bool,
    /// Repository cloned by `checkout` steps that do not name one.
    pub repository: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("relay");
        Self {
            workspace_root: base.join("workspaces"),
            cache_root: base.join("cache"),
            labels: BTreeSet::new(),
            max_concurrent_runs: 4,
            default_step_timeout: None,
            shell: "sh".to_string(),
            audit_skipped: false,
            keep_workspaces: false,
            repository: None,
        }
    }
}

impl EngineConfig {
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }
}

/// Read and parse an engine configuration file.
pub fn load_engine_config(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_engine_config(&content)
}

/// Parse engine configuration from KDL text. Missing fields keep their defaults.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = EngineConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "workspace-root" => {
                config.workspace_root = get_first_string_arg(node)
                    .map(PathBuf::from)
                    .ok_or_else(|| ConfigError::MissingField("workspace-root path".to_string()))?;
            }
            "cache-root" => {
                config.cache_root = get_first_string_arg(node)
                    .map(PathBuf::from)
                    .ok_or_else(|| ConfigError::MissingField("cache-root path".to_string()))?;
            }
            "labels" => {
                config.labels.extend(get_all_string_args(node));
            }
            "max-concurrent-runs" => {
                let value = node
                    .entries()
                    .iter()
                    .find(|e| e.name().is_none())
                    .and_then(|e| e.value().as_integer())
                    .and_then(|i| usize::try_from(i).ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        ConfigError::invalid("max-concurrent-runs", "expected a positive integer")
                    })?;
                config.max_concurrent_runs = value;
            }
            "defaults" => {
                config.default_step_timeout = get_duration_prop(node, "step-timeout")?;
                if let Some(audit) = get_bool_prop(node, "audit-skipped") {
                    config.audit_skipped = audit;
                }
                if let Some(keep) = get_bool_prop(node, "keep-workspaces") {
                    config.keep_workspaces = keep;
                }
            }
            "repository" => {
                config.repository = get_first_string_arg(node);
            }
            "shell" => {
                config.shell = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("shell program".to_string()))?;
            }
            _ => {}
        }
    }

    Ok(config)
}
