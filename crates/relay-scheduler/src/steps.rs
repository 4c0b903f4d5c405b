//! Sequential, fail-fast execution of a job's steps.

use bytes::Bytes;
use chrono::Utc;
use relay_config::{VariableContext, VariableContextBuilder};
use relay_core::executor::{CommandOutput, CommandSpec, Executor, LogLine, LogSender};
use relay_core::{Event, Job, RunId, Step, StepAction, StepResult, StepStatus};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::RunEvent;
use crate::provisioner::{CheckoutSpec, ResourceProvisioner};

/// Everything a run's steps see from the outside.
#[derive(Debug, Clone)]
pub struct RunEnv {
    pub run_id: RunId,
    pub job: String,
    pub event: Event,
    /// Run-scoped directory the first step starts in.
    pub workspace: PathBuf,
    /// Job-level environment, layered under each step's own.
    pub env: BTreeMap<String, String>,
    /// Job `vars`, available as bare `${name}` references.
    pub vars: BTreeMap<String, String>,
    pub job_timeout: Option<Duration>,
    /// Repository for checkout steps that do not name one.
    pub repository: Option<String>,
    pub cancel: CancellationToken,
    pub events: Option<mpsc::Sender<RunEvent>>,
}

impl RunEnv {
    pub fn new(run_id: RunId, job: &Job, event: Event, workspace: PathBuf) -> Self {
        Self {
            run_id,
            job: job.name.clone(),
            event,
            workspace,
            env: job.env.clone(),
            vars: job.vars.clone(),
            job_timeout: job.timeout,
            repository: None,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_repository(mut self, repository: Option<String>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Variables shared by all steps: engine variables, then the job env.
    fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("RELAY".to_string(), "true".to_string());
        env.insert("RELAY_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("RELAY_JOB".to_string(), self.job.clone());
        env.insert("RELAY_BRANCH".to_string(), self.event.branch.clone());
        env.insert("RELAY_EVENT".to_string(), self.event.kind.to_string());
        env.insert(
            "RELAY_WORKSPACE".to_string(),
            self.workspace.to_string_lossy().into_owned(),
        );
        if let Some(sha) = &self.event.sha {
            env.insert("RELAY_SHA".to_string(), sha.clone());
        }
        env
    }
}

/// Runs steps one after another on a single worker.
pub struct StepExecutor {
    executor: Arc<dyn Executor>,
    provisioner: Arc<ResourceProvisioner>,
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(executor: Arc<dyn Executor>, provisioner: Arc<ResourceProvisioner>) -> Self {
        Self {
            executor,
            provisioner,
            default_timeout: None,
        }
    }

    /// Timeout for steps where neither the step nor the job sets one.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute `steps` in order and return one result per step, in the same
    /// order.
    ///
    /// The first failing or timed out step halts the sequence and every
    /// later step is recorded as skipped. Cancellation is honored between
    /// steps only.
    pub async fn run(&self, steps: &[Step], env: &RunEnv) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(steps.len());
        let mut cwd = env.workspace.clone();
        let mut halted: Option<String> = None;

        for (index, step) in steps.iter().enumerate() {
            if halted.is_none() && env.cancel.is_cancelled() {
                info!(run_id = %env.run_id, step = %step.name, "Run cancelled, skipping remaining steps");
                halted = Some("cancelled".to_string());
            }

            if let Some(reason) = &halted {
                debug!(run_id = %env.run_id, step = %step.name, %reason, "Skipping step");
                results.push(StepResult::skipped(step.clone(), reason.clone()));
                continue;
            }

            env.emit(RunEvent::StepStarted {
                run_id: env.run_id,
                step: step.name.clone(),
                index,
            })
            .await;

            let result = self.run_step(index, step, env, &mut cwd).await;

            if result.status.is_failure() {
                warn!(
                    run_id = %env.run_id,
                    step = %step.name,
                    exit_code = ?result.exit_code,
                    "Step failed, halting run"
                );
                halted = Some(format!("step '{}' failed", step.name));
            } else {
                info!(run_id = %env.run_id, step = %step.name, duration = ?result.duration, "Step succeeded");
            }

            env.emit(RunEvent::StepCompleted {
                run_id: env.run_id,
                step: step.name.clone(),
                status: result.status.clone(),
            })
            .await;

            results.push(result);
        }

        results
    }

    async fn run_step(&self, index: usize, step: &Step, env: &RunEnv, cwd: &mut PathBuf) -> StepResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut vars = VariableContextBuilder::new()
            .with_event(&env.event)
            .with_run(env.run_id.to_string(), env.workspace.to_string_lossy())
            .with_job(env.job.clone())
            .with_step(step.name.clone(), index)
            .with_vars(&env.vars)
            .build();
        let step_env = layered_env(&mut vars, env.base_env(), &env.env, &step.env);

        if let Some(dir) = &step.working_directory {
            *cwd = cwd.join(vars.interpolate(dir));
        }
        let timeout = step.timeout.or(env.job_timeout).or(self.default_timeout);
        let template = CommandSpec::new(step.name.clone(), "", cwd.clone())
            .with_env(step_env)
            .with_timeout(timeout);

        let (logs, forwarder) = forward_logs(env, &step.name);
        let (status, exit_code, output) = self.perform(step, env, &vars, template, cwd, logs).await;

        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }

        StepResult {
            step: step.clone(),
            status,
            exit_code,
            duration: start.elapsed(),
            output,
            started_at: Some(started_at),
        }
    }

    /// Run the step's action; `logs` is dropped before this returns.
    async fn perform(
        &self,
        step: &Step,
        env: &RunEnv,
        vars: &VariableContext,
        template: CommandSpec,
        cwd: &mut PathBuf,
        logs: Option<LogSender>,
    ) -> (StepStatus, Option<i32>, Bytes) {
        match &step.action {
            StepAction::Run { command } => {
                let spec = CommandSpec {
                    script: vars.interpolate(command),
                    ..template
                };
                match self.executor.execute(spec, logs).await {
                    Ok(out) => command_outcome(out),
                    Err(e) => (
                        StepStatus::Failed {
                            message: format!("could not start command: {}", e),
                        },
                        None,
                        Bytes::new(),
                    ),
                }
            }
            StepAction::Checkout {
                repository,
                fetch_depth,
            } => {
                let repository = repository
                    .as_deref()
                    .map(|r| vars.interpolate(r))
                    .or_else(|| env.repository.clone());
                match repository {
                    Some(repository) => {
                        let spec = CheckoutSpec {
                            repository,
                            fetch_depth: *fetch_depth,
                            sha: env.event.sha.clone(),
                        };
                        let report = self
                            .provisioner
                            .checkout(&env.run_id, &spec, template, logs)
                            .await;
                        match report.outcome {
                            Ok(dir) => {
                                *cwd = dir;
                                (StepStatus::Succeeded, Some(0), report.output)
                            }
                            Err(e) => (
                                StepStatus::Failed {
                                    message: e.to_string(),
                                },
                                None,
                                report.output,
                            ),
                        }
                    }
                    None => (
                        StepStatus::Failed {
                            message: "no repository configured for checkout".to_string(),
                        },
                        None,
                        Bytes::new(),
                    ),
                }
            }
            StepAction::Cache { key, path, command } => {
                let key = vars.interpolate(key);
                let location = self.provisioner.resolve_location(&vars.interpolate(path));
                let mut vars = vars.clone();
                vars.set_cache(key.as_str(), location.to_string_lossy());
                let spec = CommandSpec {
                    script: vars.interpolate(command),
                    ..template
                };
                let report = self
                    .provisioner
                    .provision_cache(&key, &location, spec, logs)
                    .await;
                match report.outcome {
                    Ok(location) => {
                        if !report.populated_now {
                            info!(%key, location = %location.display(), "Cached resource already present");
                        }
                        (StepStatus::Succeeded, Some(0), report.output)
                    }
                    Err(e) => (
                        StepStatus::Failed {
                            message: e.to_string(),
                        },
                        None,
                        report.output,
                    ),
                }
            }
        }
    }
}

fn command_outcome(out: CommandOutput) -> (StepStatus, Option<i32>, Bytes) {
    let status = if out.timed_out {
        StepStatus::TimedOut
    } else {
        match out.exit_code {
            Some(0) => StepStatus::Succeeded,
            Some(code) => StepStatus::Failed {
                message: format!("exited with code {}", code),
            },
            None => StepStatus::Failed {
                message: "terminated by signal".to_string(),
            },
        }
    };
    (status, out.exit_code, out.output)
}

/// Engine variables < job env < step env. Each layer is interpolated with
/// the layers below it visible as `${env.NAME}`.
fn layered_env(
    vars: &mut VariableContext,
    base: BTreeMap<String, String>,
    job: &BTreeMap<String, String>,
    step: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    vars.populate_env();
    vars.env.extend(base.clone());
    let mut env = base;

    for layer in [job, step] {
        let resolved = vars.interpolate_map(layer);
        vars.env.extend(resolved.clone());
        env.extend(resolved);
    }
    env
}

/// Bridge executor log lines onto the run's event channel.
fn forward_logs(env: &RunEnv, step: &str) -> (Option<LogSender>, Option<JoinHandle<()>>) {
    let Some(events) = env.events.clone() else {
        return (None, None);
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();
    let run_id = env.run_id;
    let step = step.to_string();
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let event = RunEvent::StepOutput {
                run_id,
                step: step.clone(),
                line,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    });
    (Some(tx), Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeExecutor;
    use relay_config::EngineConfig;
    use relay_executor::ShellExecutor;
    use std::path::Path;

    struct Harness {
        _dir: tempfile::TempDir,
        workspace: PathBuf,
        provisioner: Arc<ResourceProvisioner>,
    }

    fn harness(executor: Arc<dyn Executor>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        let config = EngineConfig::default()
            .with_workspace_root(dir.path().join("work"))
            .with_cache_root(dir.path().join("cache"));
        let provisioner = Arc::new(ResourceProvisioner::new(executor, &config));
        Harness {
            _dir: dir,
            workspace,
            provisioner,
        }
    }

    fn run_env(job: &Job, workspace: &Path) -> RunEnv {
        RunEnv::new(
            RunId::new(),
            job,
            Event::push("main", ["tests/ray/test_rvdz.py"]),
            workspace.to_path_buf(),
        )
    }

    fn five_steps() -> Vec<Step> {
        vec![
            Step::run("one", "echo 1"),
            Step::run("two", "echo 2"),
            Step::run("three", "echo 3"),
            Step::run("four", "echo 4"),
            Step::run("five", "echo 5"),
        ]
    }

    fn names(results: &[StepResult]) -> Vec<&str> {
        results.iter().map(|r| r.step.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let steps = five_steps();
        let job = Job::new("e2e");

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        assert_eq!(names(&results), vec!["one", "two", "three", "four", "five"]);
        assert!(results.iter().all(|r| r.status.is_success()));
        assert!(results.iter().all(|r| r.exit_code == Some(0)));
        let scripts: Vec<String> = fake.calls().into_iter().map(|c| c.script).collect();
        assert_eq!(scripts, vec!["echo 1", "echo 2", "echo 3", "echo 4", "echo 5"]);
    }

    #[tokio::test]
    async fn test_fail_fast_at_every_position() {
        for failing in 1..=5 {
            let fake = Arc::new(FakeExecutor::new().fail_on(format!("echo {}", failing), 2));
            let h = harness(fake.clone());
            let job = Job::new("e2e");

            let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
                .run(&five_steps(), &run_env(&job, &h.workspace))
                .await;

            assert_eq!(results.len(), 5);
            assert_eq!(names(&results), vec!["one", "two", "three", "four", "five"]);
            for (i, result) in results.iter().enumerate() {
                let position = i + 1;
                if position < failing {
                    assert!(result.status.is_success());
                } else if position == failing {
                    assert!(result.status.is_failure());
                    assert_eq!(result.exit_code, Some(2));
                } else {
                    assert!(result.status.is_skipped());
                }
            }
            // No step after the failing one was ever invoked.
            assert_eq!(fake.calls().len(), failing);
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let fake = Arc::new(FakeExecutor::new().hang_on("sleep"));
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let steps = vec![
            Step::run("slow", "sleep 100").with_timeout(Duration::from_millis(20)),
            Step::run("after", "echo after"),
        ];

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        assert_eq!(results[0].status, StepStatus::TimedOut);
        assert!(results[1].status.is_skipped());
        assert_eq!(fake.call_count("echo after"), 0);
    }

    #[tokio::test]
    async fn test_timeout_precedence() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e").with_timeout(Duration::from_secs(60));
        let steps = vec![
            Step::run("own", "echo own").with_timeout(Duration::from_secs(5)),
            Step::run("inherited", "echo inherited"),
        ];

        StepExecutor::new(fake.clone(), h.provisioner.clone())
            .with_default_timeout(Some(Duration::from_secs(600)))
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        let calls = fake.calls();
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(calls[1].timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let env = run_env(&job, &h.workspace);
        env.cancel.cancel();

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&five_steps(), &env)
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.status
            == StepStatus::Skipped {
                reason: "cancelled".to_string()
            }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_takes_effect_between_steps() {
        let fake = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(200)));
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let env = run_env(&job, &h.workspace);

        let cancel = env.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&five_steps(), &env)
            .await;

        // The step in flight finishes; the rest never start.
        assert!(results[0].status.is_success());
        assert!(results[1..].iter().all(|r| r.status.is_skipped()));
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_failure_keeps_failure_reason() {
        let fake = Arc::new(FakeExecutor::new().fail_on("echo 1", 1));
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let env = run_env(&job, &h.workspace);

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&five_steps(), &env)
            .await;
        env.cancel.cancel();

        assert!(results[0].status.is_failure());
        assert_eq!(
            results[1].status,
            StepStatus::Skipped {
                reason: "step 'one' failed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_env_layering_and_interpolation() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e_gpu")
            .with_env("LEVEL", "job")
            .with_env("DATA", "/data/${event.branch}");
        let steps = vec![
            Step::run("job level", "echo ${job.name} ${env.LEVEL}"),
            Step::run("step level", "echo ${env.LEVEL}").with_env("LEVEL", "step"),
        ];

        StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        let calls = fake.calls();
        assert_eq!(calls[0].script, "echo e2e_gpu job");
        assert_eq!(calls[1].script, "echo step");
        assert_eq!(calls[0].env.get("CI").map(String::as_str), Some("true"));
        assert_eq!(calls[0].env.get("RELAY_BRANCH").map(String::as_str), Some("main"));
        assert_eq!(calls[0].env.get("RELAY_EVENT").map(String::as_str), Some("push"));
        assert_eq!(calls[0].env.get("DATA").map(String::as_str), Some("/data/main"));
        assert_eq!(calls[0].env.get("LEVEL").map(String::as_str), Some("job"));
        assert_eq!(calls[1].env.get("LEVEL").map(String::as_str), Some("step"));
    }

    #[tokio::test]
    async fn test_working_directory_chains_forward() {
        let shell: Arc<dyn Executor> = Arc::new(ShellExecutor::new());
        let h = harness(shell.clone());
        let job = Job::new("e2e");
        let steps = vec![
            Step::run("make dirs", "mkdir -p sub/inner"),
            Step::run("enter", "pwd").in_dir("sub"),
            Step::run("inherit", "pwd"),
            Step::run("cd in script", "cd inner && pwd"),
            Step::run("not leaked", "pwd"),
        ];

        let results = StepExecutor::new(shell, h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        assert!(results.iter().all(|r| r.status.is_success()));
        let out = |i: usize| results[i].output_lossy().trim_end().to_string();
        assert!(out(1).ends_with("/sub"));
        assert!(out(2).ends_with("/sub"));
        assert!(out(3).ends_with("/sub/inner"));
        assert!(out(4).ends_with("/sub"));
    }

    #[tokio::test]
    async fn test_checkout_moves_into_clone() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let env = run_env(&job, &h.workspace)
            .with_repository(Some("https://example.invalid/org/verl.git".to_string()));
        let steps = vec![Step::checkout("checkout"), Step::run("install", "pip3 install -e .")];

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&steps, &env)
            .await;

        assert!(results.iter().all(|r| r.status.is_success()));
        let calls = fake.calls();
        assert!(calls[0].script.starts_with("git clone 'https://example.invalid/org/verl.git'"));
        assert!(calls[1].working_dir.ends_with(format!("{}/verl", env.run_id)));
    }

    #[tokio::test]
    async fn test_checkout_without_repository_fails() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let steps = vec![Step::checkout("checkout"), Step::run("install", "pip3 install -e .")];

        let results = StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        assert!(results[0].status.is_failure());
        assert!(results[1].status.is_skipped());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cache_step_populates_once_across_runs() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let steps = vec![Step::cache(
            "fetch dataset",
            "verl-data",
            "verl-data",
            "git clone --depth 1 https://example.invalid/verl-data ${cache.path}",
        )];
        let executor = StepExecutor::new(fake.clone(), h.provisioner.clone());

        let first = executor.run(&steps, &run_env(&job, &h.workspace)).await;
        let second = executor.run(&steps, &run_env(&job, &h.workspace)).await;

        assert!(first[0].status.is_success());
        assert!(second[0].status.is_success());
        assert_eq!(fake.call_count("verl-data"), 1);
        assert!(second[0].output.is_empty());

        let location = h.provisioner.resolve_location("verl-data");
        assert_eq!(
            fake.calls()[0].script,
            format!(
                "git clone --depth 1 https://example.invalid/verl-data {}",
                location.display()
            )
        );
    }

    #[tokio::test]
    async fn test_real_cache_survives_workspace_removal() {
        let shell: Arc<dyn Executor> = Arc::new(ShellExecutor::new());
        let h = harness(shell.clone());
        let job = Job::new("e2e");
        let fetch = Step::cache("fetch data", "data", "data", "mkdir data && touch data/file");
        let executor = StepExecutor::new(shell, h.provisioner.clone());

        let first_ws = h.workspace.join("first");
        std::fs::create_dir_all(&first_ws).unwrap();
        let first = executor
            .run(std::slice::from_ref(&fetch), &run_env(&job, &first_ws))
            .await;
        assert!(first[0].status.is_success(), "{}", first[0].output_lossy());
        std::fs::remove_dir_all(&first_ws).unwrap();

        let location = h.provisioner.resolve_location("data");
        assert!(location.join("file").exists());

        let second_ws = h.workspace.join("second");
        std::fs::create_dir_all(&second_ws).unwrap();
        let check = Step::run("use data", format!("ls {}", location.join("file").display()));
        let second = executor.run(&[fetch, check], &run_env(&job, &second_ws)).await;
        assert!(second.iter().all(|r| r.status.is_success()));
        assert!(second[0].output.is_empty());
    }

    #[tokio::test]
    async fn test_cache_command_that_writes_elsewhere_fails() {
        let shell: Arc<dyn Executor> = Arc::new(ShellExecutor::new());
        let h = harness(shell.clone());
        let job = Job::new("e2e");
        let steps = vec![
            Step::cache("fetch data", "data", "data", "mkdir -p other"),
            Step::run("tests", "true"),
        ];

        let results = StepExecutor::new(shell, h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        assert!(results[0].status.is_failure());
        assert!(results[1].status.is_skipped());
        assert!(!h.provisioner.snapshot().await[0].populated);
    }

    #[tokio::test]
    async fn test_job_vars_are_interpolated() {
        let fake = Arc::new(FakeExecutor::new());
        let h = harness(fake.clone());
        let job = Job::new("e2e").with_var("suite", "tests/verl");
        let steps = vec![Step::run("tests", "pytest -s -x ${suite} ${unknown}")];

        StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&steps, &run_env(&job, &h.workspace))
            .await;

        assert_eq!(fake.calls()[0].script, "pytest -s -x tests/verl ${unknown}");
    }

    #[tokio::test]
    async fn test_events_are_streamed_in_order() {
        let fake = Arc::new(FakeExecutor::new().fail_on("echo 2", 1));
        let h = harness(fake.clone());
        let job = Job::new("e2e");
        let (tx, mut rx) = mpsc::channel(64);
        let env = run_env(&job, &h.workspace).with_events(tx);

        StepExecutor::new(fake.clone(), h.provisioner.clone())
            .run(&five_steps(), &env)
            .await;
        drop(env);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(match event {
                RunEvent::StepStarted { step, .. } => format!("start {}", step),
                RunEvent::StepOutput { step, line, .. } => format!("out {} {}", step, line.content),
                RunEvent::StepCompleted { step, status, .. } => {
                    format!("done {} {}", step, status.is_success())
                }
                other => format!("{:?}", other),
            });
        }
        assert_eq!(
            seen,
            vec![
                "start one",
                "out one $ echo 1",
                "done one true",
                "start two",
                "out two $ echo 2",
                "done two false",
            ]
        );
    }
}
