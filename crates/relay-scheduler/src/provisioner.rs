//! Idempotent provisioning of run prerequisites.
//!
//! Shared resources (datasets, tool caches) are keyed by name. For each key
//! the existence check and the population run inside one async lock, so two
//! runs never populate the same location at the same time, and a resource is
//! populated at most once. Checkouts use a fresh run-scoped key and are
//! always cloned again.

use bytes::Bytes;
use relay_config::EngineConfig;
use relay_core::executor::{CommandSpec, Executor, LogSender};
use relay_core::{CachedResource, Error, Result, RunId};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type Slot = Arc<tokio::sync::Mutex<CachedResource>>;

/// Environment variable holding the absolute location a cache command must fill.
pub const CACHE_PATH_ENV: &str = "RELAY_CACHE_PATH";

/// Where a provisioning step ended up, with the output of any command it ran.
#[derive(Debug)]
pub struct ProvisionReport {
    pub outcome: Result<PathBuf>,
    /// Output of the populate command; empty if the resource was reused.
    pub output: Bytes,
    /// Whether a populate command ran during this call.
    pub populated_now: bool,
}

/// What to clone for a checkout step.
#[derive(Debug, Clone)]
pub struct CheckoutSpec {
    pub repository: String,
    /// 0 clones full history.
    pub fetch_depth: u32,
    pub sha: Option<String>,
}

pub struct ResourceProvisioner {
    executor: Arc<dyn Executor>,
    workspace_root: PathBuf,
    cache_root: PathBuf,
    resources: Mutex<HashMap<String, Slot>>,
}

impl ResourceProvisioner {
    pub fn new(executor: Arc<dyn Executor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            workspace_root: config.workspace_root.clone(),
            cache_root: config.cache_root.clone(),
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn slot(&self, key: &str) -> Slot {
        let mut table = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(CachedResource::new(key))))
            .clone()
    }

    fn forget(&self, key: &str) {
        let mut table = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        table.remove(key);
    }

    /// Return the location for `key`, calling `populate` only if no earlier
    /// call populated it.
    ///
    /// Concurrent callers with the same key wait for each other. If
    /// `populate` fails the resource stays unpopulated and the next caller
    /// tries again.
    pub async fn ensure<F, Fut>(&self, key: &str, populate: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let slot = self.slot(key);
        let mut resource = slot.lock().await;

        if resource.populated {
            debug!(key, location = %resource.location.display(), "Resource already provisioned");
            return Ok(resource.location.clone());
        }

        info!(key, "Provisioning resource");
        match populate().await {
            Ok(location) => {
                resource.location = location.clone();
                resource.populated = true;
                info!(key, location = %location.display(), "Resource provisioned");
                Ok(location)
            }
            Err(e) => {
                warn!(key, error = %e, "Provisioning failed");
                Err(match e {
                    Error::Provisioning { .. } => e,
                    other => Error::provisioning(key, other),
                })
            }
        }
    }

    /// Like [`ensure`](Self::ensure), but an existing `location` on disk
    /// counts as populated, so resources survive engine restarts.
    pub async fn ensure_at<F, Fut>(&self, key: &str, location: &Path, populate: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let location = location.to_path_buf();
        self.ensure(key, move || async move {
            if tokio::fs::try_exists(&location).await.unwrap_or(false) {
                info!(key, location = %location.display(), "Found existing resource on disk");
                return Ok(location);
            }

            if let Err(e) = populate().await {
                // The location did not exist before; drop whatever was half written.
                if tokio::fs::try_exists(&location).await.unwrap_or(false) {
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&location).await {
                        warn!(key, location = %location.display(), error = %cleanup, "Failed to remove partial resource");
                    }
                }
                return Err(e);
            }

            if !tokio::fs::try_exists(&location).await.unwrap_or(false) {
                return Err(Error::provisioning(
                    key,
                    format!("populate command did not create {}", location.display()),
                ));
            }
            Ok(location)
        })
        .await
    }

    /// Resolve a cache path: a leading `~` or `~/` expands to `$HOME`,
    /// relative paths live under the cache root.
    pub fn resolve_location(&self, path: &str) -> PathBuf {
        let home_relative = match path {
            "~" => Some(""),
            _ => path.strip_prefix("~/"),
        };
        if let (Some(rest), Some(home)) = (home_relative, std::env::var_os("HOME")) {
            let rest = rest.trim_start_matches('/');
            return if rest.is_empty() {
                PathBuf::from(home)
            } else {
                PathBuf::from(home).join(rest)
            };
        }
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.cache_root.join(path)
        }
    }

    /// Populate the cached resource `key` at `location` by running `command`
    /// unless it is already present.
    ///
    /// The command starts in the parent of `location` with the location
    /// itself in `RELAY_CACHE_PATH`, and must leave it on disk.
    pub async fn provision_cache(
        &self,
        key: &str,
        location: &Path,
        mut command: CommandSpec,
        logs: Option<LogSender>,
    ) -> ProvisionReport {
        let mut output = Bytes::new();
        let mut populated_now = false;

        if let Some(parent) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.working_dir = parent.to_path_buf();
        }
        command.env.insert(
            CACHE_PATH_ENV.to_string(),
            location.to_string_lossy().into_owned(),
        );

        let outcome = {
            let output = &mut output;
            let populated_now = &mut populated_now;
            self.ensure_at(key, location, move || async move {
                *populated_now = true;
                tokio::fs::create_dir_all(&command.working_dir).await?;
                self.run_populate(key, command, logs, output).await
            })
            .await
        };

        ProvisionReport {
            outcome,
            output,
            populated_now,
        }
    }

    /// Clone the repository into a fresh directory owned by `run_id`.
    ///
    /// Any leftovers from an earlier attempt with the same run id are removed
    /// first. The key is never shared, so concurrent runs do not wait on
    /// each other here.
    pub async fn checkout(
        &self,
        run_id: &RunId,
        spec: &CheckoutSpec,
        template: CommandSpec,
        logs: Option<LogSender>,
    ) -> ProvisionReport {
        let key = format!("checkout:{}", run_id);
        let run_dir = self.workspace_root.join(run_id.to_string());
        let target = run_dir.join(repository_dir_name(&spec.repository));

        let mut output = Bytes::new();
        let outcome = {
            let output = &mut output;
            let key = key.as_str();
            self.ensure(key, move || async move {
                if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    tokio::fs::remove_dir_all(&target).await?;
                }
                tokio::fs::create_dir_all(&run_dir).await?;

                let mut script = String::from("git clone");
                if spec.fetch_depth > 0 {
                    script.push_str(&format!(" --depth {}", spec.fetch_depth));
                }
                script.push_str(&format!(
                    " {} {}",
                    shell_quote(&spec.repository),
                    shell_quote(&target.to_string_lossy())
                ));
                if let Some(sha) = &spec.sha {
                    script.push_str(&format!(
                        " && git -C {} checkout --quiet {}",
                        shell_quote(&target.to_string_lossy()),
                        shell_quote(sha)
                    ));
                }

                let command = CommandSpec {
                    script,
                    working_dir: run_dir.clone(),
                    ..template
                };
                self.run_populate(key, command, logs, output).await?;
                Ok::<_, Error>(target)
            })
            .await
        };
        self.forget(&key);

        ProvisionReport {
            outcome,
            output,
            populated_now: true,
        }
    }

    async fn run_populate(
        &self,
        key: &str,
        command: CommandSpec,
        logs: Option<LogSender>,
        captured: &mut Bytes,
    ) -> Result<()> {
        let result = self
            .executor
            .execute(command, logs)
            .await
            .map_err(|e| Error::provisioning(key, e))?;
        *captured = result.output.clone();

        if result.timed_out {
            return Err(Error::provisioning(key, "populate command timed out"));
        }
        match result.exit_code {
            Some(0) => Ok(()),
            Some(code) => Err(Error::provisioning(
                key,
                format!("populate command exited with code {}", code),
            )),
            None => Err(Error::provisioning(key, "populate command was killed")),
        }
    }

    /// Known resources and whether they are populated.
    pub async fn snapshot(&self) -> Vec<CachedResource> {
        let slots: Vec<Slot> = {
            let table = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
            table.values().cloned().collect()
        };
        let mut resources = Vec::with_capacity(slots.len());
        for slot in slots {
            resources.push(slot.lock().await.clone());
        }
        resources.sort_by(|a, b| a.key.cmp(&b.key));
        resources
    }
}

/// Directory name for a clone of `repository`: the last path segment
/// without a `.git` suffix.
fn repository_dir_name(repository: &str) -> String {
    let name = repository
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if name.is_empty() || name == "." || name == ".." {
        "repo".to_string()
    } else {
        name.to_string()
    }
}

/// Single-quote a value for `sh`.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
