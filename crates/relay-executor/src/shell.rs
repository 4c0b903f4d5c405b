//! Local shell executor implementation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use relay_core::executor::*;
use relay_core::{Error, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep reading output after the process exits. Background
/// processes that inherited the pipes would otherwise hold the step open.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Time between SIGTERM and SIGKILL when a step times out.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

type Chunk = (LogStream, Vec<u8>);

/// Runs step scripts with a local shell on the runner machine.
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Use a different shell program (it must accept `-c <script>`).
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, spec: CommandSpec, logs: Option<LogSender>) -> Result<CommandOutput> {
        let start = Instant::now();

        info!(
            step = %spec.label,
            dir = %spec.working_dir.display(),
            "Starting command"
        );

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&spec.script)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a timeout reaches everything the script forked.
        let mut child: AsyncGroupChild = command.group_spawn()?;

        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not captured".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel::<Chunk>();
        let pumps = [
            tokio::spawn(pump(stdout, LogStream::Stdout, tx.clone())),
            tokio::spawn(pump(stderr, LogStream::Stderr, tx)),
        ];
        let collector = tokio::spawn(collect(rx, logs));

        let (exit_code, timed_out) = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (status?.code(), false),
                Err(_) => {
                    warn!(step = %spec.label, timeout = ?limit, "Command timed out, killing");
                    terminate_process_group(&mut child, TERMINATE_GRACE).await;
                    (None, true)
                }
            },
            None => (child.wait().await?.code(), false),
        };

        finish_pumps(pumps, if timed_out { Duration::ZERO } else { OUTPUT_GRACE }).await;

        let output = collector
            .await
            .map_err(|e| Error::Internal(format!("output collector failed: {}", e)))?;

        let duration = start.elapsed();
        debug!(step = %spec.label, ?exit_code, timed_out, ?duration, "Command finished");

        Ok(CommandOutput {
            exit_code,
            output,
            timed_out,
            duration,
        })
    }
}

/// SIGTERM the whole group, wait up to `grace` for the shell to exit, then
/// SIGKILL whatever is left and reap.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };
    let pgid = Pid::from_raw(-(pid as i32));

    match signal::kill(pgid, Signal::SIGTERM) {
        Err(e) if e != Errno::ESRCH => warn!(pid, error = ?e, "SIGTERM to process group failed"),
        _ => {}
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The shell may be gone while children that ignored SIGTERM are not.
    match signal::kill(pgid, Signal::SIGKILL) {
        Err(e) if e != Errno::ESRCH => warn!(pid, error = ?e, "SIGKILL to process group failed"),
        _ => {}
    }

    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn pump<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Output read error");
                break;
            }
        }
    }
}

/// Merge both streams into one buffer, forwarding each line to `logs`.
async fn collect(mut rx: mpsc::UnboundedReceiver<Chunk>, logs: Option<LogSender>) -> Bytes {
    let mut buf = BytesMut::new();
    while let Some((stream, chunk)) = rx.recv().await {
        if let Some(logs) = &logs {
            let content = String::from_utf8_lossy(&chunk);
            let _ = logs.send(LogLine::new(stream, content.trim_end()));
        }
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

async fn finish_pumps(pumps: [JoinHandle<()>; 2], grace: Duration) {
    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(grace, pump).await.is_err() {
            abort.abort();
        }
    }
}
