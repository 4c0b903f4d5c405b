//! Event dispatcher - turns a repository event into runs of matching jobs.

use futures::future::join_all;
use relay_config::EngineConfig;
use relay_core::executor::{Executor, LogLine};
use relay_core::{
    Error, Event, FailureCause, Job, Result, Run, RunId, RunStatus, StepResult, StepStatus,
    Workflow, select_jobs,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provisioner::ResourceProvisioner;
use crate::reporter::RunReporter;
use crate::steps::{RunEnv, StepExecutor};

/// Event emitted while runs execute.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        job: String,
    },
    StepStarted {
        run_id: RunId,
        step: String,
        index: usize,
    },
    StepOutput {
        run_id: RunId,
        step: String,
        line: LogLine,
    },
    StepCompleted {
        run_id: RunId,
        step: String,
        status: StepStatus,
    },
    RunCompleted {
        run_id: RunId,
        job: String,
        status: RunStatus,
    },
}

/// Outcome of dispatching one event.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Runs that executed, in job declaration order.
    pub runs: Vec<Run>,
    /// Jobs the trigger filter rejected, recorded only when auditing.
    pub skipped: Vec<Run>,
    /// Jobs whose `runs-on` labels this runner cannot satisfy.
    pub unschedulable: Vec<Error>,
    /// Runs whose task died before reporting.
    pub errors: Vec<Error>,
}

impl DispatchReport {
    /// True if nothing failed. An event that matched no job succeeds.
    pub fn success(&self) -> bool {
        self.unschedulable.is_empty()
            && self.errors.is_empty()
            && self.runs.iter().all(|r| r.status == RunStatus::Succeeded)
    }
}

/// Handle to a run executing on its own task.
pub struct RunHandle {
    pub id: RunId,
    pub job: String,
    cancel: CancellationToken,
    handle: JoinHandle<Run>,
}

impl RunHandle {
    /// Request cancellation. Takes effect before the next step starts.
    pub fn cancel(&self) {
        info!(run_id = %self.id, "Cancelling run");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<Run> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("run {} task failed: {}", self.id, e)))
    }
}

/// State shared by every run task.
struct RunContext {
    steps: StepExecutor,
    reporter: RunReporter,
    limiter: Semaphore,
    workspace_root: PathBuf,
    keep_workspaces: bool,
    repository: Option<String>,
}

/// Dispatches events against a workflow and executes the resulting runs.
pub struct Dispatcher {
    workflow: Workflow,
    config: EngineConfig,
    provisioner: Arc<ResourceProvisioner>,
    ctx: Arc<RunContext>,
    events: Option<mpsc::Sender<RunEvent>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(workflow: Workflow, executor: Arc<dyn Executor>, config: EngineConfig) -> Self {
        let provisioner = Arc::new(ResourceProvisioner::new(executor.clone(), &config));
        let steps = StepExecutor::new(executor, provisioner.clone())
            .with_default_timeout(config.default_step_timeout);
        let ctx = Arc::new(RunContext {
            steps,
            reporter: RunReporter::new(),
            limiter: Semaphore::new(config.max_concurrent_runs.max(1)),
            workspace_root: config.workspace_root.clone(),
            keep_workspaces: config.keep_workspaces,
            repository: config.repository.clone(),
        });
        Self {
            workflow,
            config,
            provisioner,
            ctx,
            events: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Send run events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Cancelling this token cancels every run started by this dispatcher.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// The provisioner shared by all runs of this dispatcher.
    pub fn provisioner(&self) -> &Arc<ResourceProvisioner> {
        &self.provisioner
    }

    /// Jobs that `event` would start, each once, in declaration order.
    pub fn select(&self, event: &Event) -> Vec<&Job> {
        select_jobs(event, &self.workflow.jobs)
    }

    /// Start a run of `job` for `event` on its own task.
    ///
    /// Fails with [`Error::Infrastructure`] if this runner lacks any of the
    /// job's `runs-on` labels; no run is created in that case.
    pub fn spawn_run(&self, job: &Job, event: &Event) -> Result<RunHandle> {
        let missing = job.missing_labels(&self.config.labels);
        if !missing.is_empty() {
            warn!(job = %job.name, ?missing, "No runner satisfies job labels");
            return Err(Error::Infrastructure {
                job: job.name.clone(),
                missing,
            });
        }

        let run = Run::new(job.clone(), event.clone());
        let id = run.id;
        let cancel = self.shutdown.child_token();

        info!(run_id = %id, job = %job.name, "Created run");
        let handle = tokio::spawn(execute_run(
            self.ctx.clone(),
            self.events.clone(),
            run,
            cancel.clone(),
        ));

        Ok(RunHandle {
            id,
            job: job.name.clone(),
            cancel,
            handle,
        })
    }

    /// Run every job whose triggers accept `event` and wait for all of them.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        info!(
            kind = %event.kind,
            branch = %event.branch,
            changed = event.changed_paths.len(),
            "Dispatching event"
        );

        let selected = self.select(event);
        let mut report = DispatchReport::default();
        let mut handles = Vec::new();

        for job in &self.workflow.jobs {
            if selected.iter().any(|j| j.name == job.name) {
                match self.spawn_run(job, event) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => report.unschedulable.push(e),
                }
            } else {
                debug!(job = %job.name, "Trigger filter rejected event");
                if self.config.audit_skipped {
                    report.skipped.push(Run::skipped(job.clone(), event.clone()));
                }
            }
        }

        for outcome in join_all(handles.into_iter().map(RunHandle::wait)).await {
            match outcome {
                Ok(run) => report.runs.push(run),
                Err(e) => {
                    error!(error = %e, "Run did not complete");
                    report.errors.push(e);
                }
            }
        }

        info!(
            runs = report.runs.len(),
            skipped = report.skipped.len(),
            unschedulable = report.unschedulable.len(),
            "Dispatch finished"
        );
        report
    }
}

async fn emit(events: &Option<mpsc::Sender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

async fn execute_run(
    ctx: Arc<RunContext>,
    events: Option<mpsc::Sender<RunEvent>>,
    mut run: Run,
    cancel: CancellationToken,
) -> Run {
    // A run cancelled while queued does not wait for a slot; its steps are all skipped.
    let _permit = tokio::select! {
        permit = ctx.limiter.acquire() => permit.ok(),
        _ = cancel.cancelled() => None,
    };

    if let Err(e) = run.transition(RunStatus::Running) {
        error!(run_id = %run.id, error = %e, "Run could not start");
        return run;
    }
    emit(&events, RunEvent::RunStarted {
        run_id: run.id,
        job: run.job.name.clone(),
    })
    .await;

    let workspace = ctx.workspace_root.join(run.id.to_string());
    let mut workspace_error = None;

    run.step_results = match tokio::fs::create_dir_all(&workspace).await {
        Ok(()) => {
            let mut env = RunEnv::new(run.id, &run.job, run.event.clone(), workspace.clone())
                .with_repository(ctx.repository.clone())
                .with_cancel(cancel);
            if let Some(tx) = &events {
                env = env.with_events(tx.clone());
            }
            ctx.steps.run(&run.job.steps, &env).await
        }
        Err(e) => {
            error!(run_id = %run.id, workspace = %workspace.display(), error = %e, "Could not create workspace");
            let reason = format!("workspace unavailable: {}", e);
            workspace_error = Some(e.to_string());
            run.job
                .steps
                .iter()
                .map(|s| StepResult::skipped(s.clone(), reason.clone()))
                .collect()
        }
    };

    let mut run = ctx.reporter.finalize(run);
    if let Some(message) = workspace_error {
        run.failure = Some(FailureCause::Provisioning {
            step: "workspace".to_string(),
            message,
        });
    }

    if !ctx.keep_workspaces {
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run_id = %run.id, error = %e, "Could not remove workspace");
            }
        }
    }

    emit(&events, RunEvent::RunCompleted {
        run_id: run.id,
        job: run.job.name.clone(),
        status: run.status,
    })
    .await;

    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeExecutor;
    use async_trait::async_trait;
    use relay_core::executor::{CommandOutput, CommandSpec, LogSender};
    use relay_core::{EventKind, Step, TriggerRule};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn py_rule(kind: EventKind) -> TriggerRule {
        TriggerRule::new(kind)
            .with_branches(["main"])
            .with_paths(["**/*.py"])
    }

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::default()
            .with_workspace_root(dir.join("work"))
            .with_cache_root(dir.join("cache"))
            .with_labels(["self-hosted", "gpu"])
    }

    fn e2e_job(name: &str) -> Job {
        Job::new(name)
            .with_label("gpu")
            .with_trigger(py_rule(EventKind::Push))
            .with_trigger(TriggerRule::new(EventKind::Push).with_branches(["main"]))
            .with_step(Step::run("install", "pip3 install -e .[test]"))
            .with_step(Step::run("verl tests", "pytest -s -x tests/verl"))
    }

    fn docs_job() -> Job {
        Job::new("docs")
            .with_trigger(
                TriggerRule::new(EventKind::Push)
                    .with_branches(["main"])
                    .with_paths(["docs/**"]),
            )
            .with_step(Step::run("build", "make docs"))
    }

    fn workflow(jobs: Vec<Job>) -> Workflow {
        Workflow {
            name: "e2e".to_string(),
            jobs,
        }
    }

    fn py_push() -> Event {
        Event::push("main", ["tests/ray/test_rvdz.py"])
    }

    #[tokio::test]
    async fn test_dispatch_runs_matching_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let dispatcher =
            Dispatcher::new(workflow(vec![e2e_job("e2e"), docs_job()]), fake.clone(), config(dir.path()));

        let report = dispatcher.dispatch(&py_push()).await;

        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].job.name, "e2e");
        assert_eq!(report.runs[0].status, RunStatus::Succeeded);
        assert!(report.skipped.is_empty());
        assert!(report.success());
        // Two matching rules, still one run: two commands.
        assert_eq!(fake.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_audit_records_skipped_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.audit_skipped = true;
        let fake = Arc::new(FakeExecutor::new());
        let dispatcher =
            Dispatcher::new(workflow(vec![e2e_job("e2e"), docs_job()]), fake, config);

        let report = dispatcher.dispatch(&py_push()).await;

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].job.name, "docs");
        assert_eq!(report.skipped[0].status, RunStatus::Skipped);
        assert!(report.skipped[0].step_results.is_empty());
    }

    #[tokio::test]
    async fn test_no_match_creates_no_runs() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let dispatcher = Dispatcher::new(workflow(vec![docs_job()]), fake.clone(), config(dir.path()));

        let report = dispatcher.dispatch(&Event::push("dev", ["a.py"])).await;

        assert!(report.runs.is_empty());
        assert!(report.skipped.is_empty());
        assert!(report.success());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_labels_are_unschedulable() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let config = EngineConfig::default()
            .with_workspace_root(dir.path().join("work"))
            .with_labels(["self-hosted"]);
        let dispatcher = Dispatcher::new(workflow(vec![e2e_job("e2e")]), fake.clone(), config);

        let report = dispatcher.dispatch(&py_push()).await;

        assert!(report.runs.is_empty());
        assert!(!report.success());
        assert!(matches!(
            &report.unschedulable[0],
            Error::Infrastructure { job, missing } if job == "e2e" && missing == &vec!["gpu".to_string()]
        ));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new().fail_on("pip3 install", 1));
        let dispatcher = Dispatcher::new(workflow(vec![e2e_job("e2e")]), fake, config(dir.path()));

        let report = dispatcher.dispatch(&py_push()).await;
        let run = &report.runs[0];

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.failure,
            Some(FailureCause::Step {
                step: "install".to_string(),
                exit_code: Some(1)
            })
        );
        assert!(run.step_results[1].status.is_skipped());
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_workspace_removed_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let dispatcher = Dispatcher::new(workflow(vec![e2e_job("e2e")]), fake.clone(), config(dir.path()));
        let report = dispatcher.dispatch(&py_push()).await;
        let id = report.runs[0].id;
        assert!(!dir.path().join("work").join(id.to_string()).exists());

        let mut keep = config(dir.path());
        keep.keep_workspaces = true;
        let dispatcher = Dispatcher::new(workflow(vec![e2e_job("e2e")]), fake, keep);
        let report = dispatcher.dispatch(&py_push()).await;
        let id = report.runs[0].id;
        assert!(dir.path().join("work").join(id.to_string()).is_dir());
    }

    #[tokio::test]
    async fn test_cancel_spawned_run() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(200)));
        let job = e2e_job("e2e").with_step(Step::run("ray tests", "pytest -s -x tests/ray"));
        let dispatcher = Dispatcher::new(workflow(vec![job.clone()]), fake.clone(), config(dir.path()));

        let handle = dispatcher.spawn_run(&job, &py_push()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let run = handle.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(FailureCause::Cancelled));
        assert!(run.step_results[0].status.is_success());
        assert!(run.step_results[1..].iter().all(|r| r.status.is_skipped()));
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_runs() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(200)));
        let dispatcher = Dispatcher::new(
            workflow(vec![e2e_job("a"), e2e_job("b")]),
            fake.clone(),
            config(dir.path()),
        );

        let shutdown = dispatcher.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });
        let report = dispatcher.dispatch(&py_push()).await;

        assert_eq!(report.runs.len(), 2);
        for run in &report.runs {
            assert_eq!(run.failure, Some(FailureCause::Cancelled));
            assert!(run.step_results[1].status.is_skipped());
        }
        assert_eq!(fake.call_count("pytest"), 0);
    }

    #[tokio::test]
    async fn test_events_bracket_each_run() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let (tx, mut rx) = mpsc::channel(256);
        let dispatcher = Dispatcher::new(workflow(vec![e2e_job("e2e")]), fake, config(dir.path()))
            .with_events(tx);

        let report = dispatcher.dispatch(&py_push()).await;
        drop(dispatcher);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { job, .. }) if job == "e2e"));
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunCompleted { run_id, status: RunStatus::Succeeded, .. }) if *run_id == report.runs[0].id
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_share_cache() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(50)));
        let jobs: Vec<Job> = (0..4)
            .map(|i| {
                Job::new(format!("e2e-{}", i))
                    .with_trigger(py_rule(EventKind::Push))
                    .with_step(Step::cache(
                        "fetch dataset",
                        "verl-data",
                        "verl-data",
                        "git clone --depth 1 https://example.invalid/verl-data verl-data",
                    ))
                    .with_step(Step::run("verl tests", "pytest -s -x tests/verl"))
            })
            .collect();
        let dispatcher = Dispatcher::new(workflow(jobs), fake.clone(), config(dir.path()));

        let report = dispatcher.dispatch(&py_push()).await;

        assert_eq!(report.runs.len(), 4);
        assert!(report.success());
        assert_eq!(fake.call_count("git clone"), 1);
        assert_eq!(fake.call_count("pytest"), 4);
        let names: Vec<&str> = report.runs.iter().map(|r| r.job.name.as_str()).collect();
        assert_eq!(names, vec!["e2e-0", "e2e-1", "e2e-2", "e2e-3"]);
    }

    /// Tracks how many commands run at once.
    #[derive(Default)]
    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Executor for ConcurrencyGauge {
        fn name(&self) -> &'static str {
            "gauge"
        }

        async fn execute(&self, _spec: CommandSpec, _logs: Option<LogSender>) -> Result<CommandOutput> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandOutput {
                exit_code: Some(0),
                output: bytes::Bytes::new(),
                timed_out: false,
                duration: Duration::from_millis(40),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_concurrent_runs_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = Arc::new(ConcurrencyGauge::default());
        let mut config = config(dir.path());
        config.max_concurrent_runs = 2;
        let jobs: Vec<Job> = (0..6)
            .map(|i| {
                Job::new(format!("job-{}", i))
                    .with_trigger(py_rule(EventKind::Push))
                    .with_step(Step::run("test", "pytest"))
            })
            .collect();
        let dispatcher = Dispatcher::new(workflow(jobs), gauge.clone(), config);

        let report = dispatcher.dispatch(&py_push()).await;

        assert_eq!(report.runs.len(), 6);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }
}
