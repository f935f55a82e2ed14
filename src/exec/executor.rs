//! Pipeline process execution.
//!
//! Every stage runs in its own session-leader process group so that
//! termination reaches grandchildren. Stage stdout feeds the next stage's
//! stdin; the last stage's stdout and every stage's stderr are captured in
//! memory. Cancellation and the per-exec timeout send SIGTERM to each
//! group, wait [`SIG_KILL_DELAY`], then SIGKILL.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace window between SIGTERM and SIGKILL when killing process groups.
pub const SIG_KILL_DELAY: Duration = Duration::from_secs(3);

/// Terminal state of one pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub pid: i32,
    /// Equal to `pid`: each stage leads its own group.
    pub pgid: i32,
    /// Exit code; -1 when the process was killed by a signal.
    pub code: i32,
    pub err: Option<String>,
}

/// Why a pipeline run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// A stage failed to start.
    Spawn(String),
    /// Waiting on a stage failed.
    Wait(String),
    /// A stage exited non-zero (fail-fast over the whole pipeline).
    Stage { cmd: String, code: i32 },
    /// The run was cancelled from outside (new activity or shutdown).
    Canceled,
    /// The per-exec timeout elapsed.
    DeadlineExceeded,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Spawn(msg) => write!(f, "failed to start command: {msg}"),
            ExecError::Wait(msg) => write!(f, "failed to wait for command: {msg}"),
            ExecError::Stage { cmd, code } => {
                write!(f, "command [{cmd}] exited with status {code}")
            }
            ExecError::Canceled => f.write_str("context canceled"),
            ExecError::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

impl std::error::Error for ExecError {}

impl ExecError {
    /// True for the cancellation-class errors that map to a `Canceled`
    /// status rather than `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecError::Canceled | ExecError::DeadlineExceeded)
    }
}

/// Aggregated result of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Captured stdout of the final stage.
    pub stdout: String,
    /// Captured stderr of every stage, in stage order.
    pub stderr: String,
    pub procs: Vec<ProcessResult>,
    pub err: Option<ExecError>,
}

/// Run a parsed pipeline to completion, cancellation, or timeout.
pub async fn run_pipeline(
    cancel: &CancellationToken,
    timeout: Duration,
    stages: &[Vec<String>],
    dir: &Path,
    env: &[(String, String)],
) -> PipelineOutcome {
    let mut outcome = PipelineOutcome::default();

    let mut children: Vec<Child> = Vec::with_capacity(stages.len());
    // Pids must be captured at spawn: the child handle forgets its id once
    // the process has been reaped.
    let mut pids: Vec<i32> = Vec::with_capacity(stages.len());
    let mut stderr_readers = Vec::with_capacity(stages.len());
    let mut stdout_reader = None;

    for (i, argv) in stages.iter().enumerate() {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        match children.last_mut() {
            None => {
                cmd.stdin(Stdio::null());
            }
            Some(prev) => match stage_stdin(prev) {
                Ok(stdin) => {
                    cmd.stdin(stdin);
                }
                Err(e) => {
                    outcome.err = Some(ExecError::Spawn(e));
                    kill_groups(&pids);
                    reap(children, &pids, &mut outcome).await;
                    return outcome;
                }
            },
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                outcome.err = Some(ExecError::Spawn(format!("[{}]: {e}", argv.join(" "))));
                kill_groups(&pids);
                reap(children, &pids, &mut outcome).await;
                return outcome;
            }
        };
        pids.push(child.id().map(|p| p as i32).unwrap_or(-1));

        if let Some(stderr) = child.stderr.take() {
            stderr_readers.push(tokio::spawn(read_to_end(stderr)));
        }
        if i == stages.len() - 1 {
            if let Some(stdout) = child.stdout.take() {
                stdout_reader = Some(tokio::spawn(read_to_end(stdout)));
            }
        }

        children.push(child);
    }

    let pgids = pids.clone();
    debug!(?pgids, "pipeline started");

    let waiter = wait_all(&mut children);
    tokio::pin!(waiter);

    let mut canceled = false;
    let mut timed_out = false;
    let statuses = tokio::select! {
        statuses = &mut waiter => statuses,
        _ = cancel.cancelled() => {
            canceled = true;
            terminate(&pgids, &mut waiter).await
        }
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            terminate(&pgids, &mut waiter).await
        }
    };

    for (&pid, status) in pids.iter().zip(&statuses) {
        outcome.procs.push(process_result(pid, status));
    }

    if let Some(reader) = stdout_reader {
        if let Ok(bytes) = reader.await {
            outcome.stdout = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    for reader in stderr_readers {
        if let Ok(bytes) = reader.await {
            outcome.stderr.push_str(&String::from_utf8_lossy(&bytes));
        }
    }

    outcome.err = if canceled {
        Some(ExecError::Canceled)
    } else if timed_out {
        Some(ExecError::DeadlineExceeded)
    } else {
        first_failure(stages, &statuses)
    };

    outcome
}

/// Wait for every stage in order. All stages run concurrently, so the order
/// only affects which result is observed first.
async fn wait_all(children: &mut [Child]) -> Vec<std::io::Result<ExitStatus>> {
    let mut statuses = Vec::with_capacity(children.len());
    for child in children {
        statuses.push(child.wait().await);
    }
    statuses
}

/// SIGTERM every group, allow [`SIG_KILL_DELAY`] for graceful exits, then
/// SIGKILL whatever is left and reap.
async fn terminate<W>(pgids: &[i32], mut waiter: W) -> W::Output
where
    W: std::future::Future<Output = Vec<std::io::Result<ExitStatus>>> + Unpin,
{
    signal_groups(pgids, TERM);
    match tokio::time::timeout(SIG_KILL_DELAY, &mut waiter).await {
        Ok(statuses) => statuses,
        Err(_) => {
            warn!(?pgids, "process groups survived SIGTERM; sending SIGKILL");
            signal_groups(pgids, KILL);
            waiter.await
        }
    }
}

fn first_failure(
    stages: &[Vec<String>],
    statuses: &[std::io::Result<ExitStatus>],
) -> Option<ExecError> {
    for (argv, status) in stages.iter().zip(statuses) {
        match status {
            Err(e) => return Some(ExecError::Wait(e.to_string())),
            Ok(status) if !status.success() => {
                return Some(ExecError::Stage {
                    cmd: argv.join(" "),
                    code: status.code().unwrap_or(-1),
                })
            }
            Ok(_) => {}
        }
    }
    None
}

fn process_result(pid: i32, status: &std::io::Result<ExitStatus>) -> ProcessResult {
    match status {
        Ok(status) => ProcessResult {
            pid,
            pgid: pid,
            code: status.code().unwrap_or(-1),
            err: None,
        },
        Err(e) => ProcessResult {
            pid,
            pgid: pid,
            code: -1,
            err: Some(e.to_string()),
        },
    }
}

/// Hand the previous stage's stdout to the next stage as stdin.
#[cfg(unix)]
fn stage_stdin(prev: &mut Child) -> Result<Stdio, String> {
    let stdout = prev
        .stdout
        .take()
        .ok_or_else(|| "previous stage stdout already taken".to_string())?;
    stdout
        .try_into()
        .map_err(|e: std::io::Error| e.to_string())
}

#[cfg(not(unix))]
fn stage_stdin(_prev: &mut Child) -> Result<Stdio, String> {
    Ok(Stdio::null())
}

async fn read_to_end<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

#[cfg(unix)]
const TERM: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGTERM;
#[cfg(unix)]
const KILL: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGKILL;
#[cfg(not(unix))]
const TERM: i32 = 0;
#[cfg(not(unix))]
const KILL: i32 = 0;

#[cfg(unix)]
fn signal_groups(pgids: &[i32], signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    for &pgid in pgids {
        // ESRCH just means the group already exited.
        if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
            debug!(pgid, signal = %signal, error = %e, "killpg");
        }
    }
}

#[cfg(not(unix))]
fn signal_groups(_pgids: &[i32], _signal: i32) {}

/// Best-effort immediate kill used when a later stage fails to spawn.
fn kill_groups(pgids: &[i32]) {
    signal_groups(pgids, KILL);
}

async fn reap(mut children: Vec<Child>, pids: &[i32], outcome: &mut PipelineOutcome) {
    for (child, &pid) in children.iter_mut().zip(pids) {
        let status = child.wait().await;
        outcome.procs.push(process_result(pid, &status));
    }
}
