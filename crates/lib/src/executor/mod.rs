//! Process executor: runs an authorized command as its own OS process group.
//!
//! Lifecycle: `Pending → Running → {Completed, TimedOut, Killed, SpawnFailed}`.
//! The deadline starts when the request reaches the executor (including any wait for an
//! execution slot) and is enforced whether or not the caller cancels. On deadline or
//! cancellation the whole process group gets SIGTERM, then SIGKILL after the grace period.
//!
//! Arguments are handed to the OS as a vector; no shell is involved.

mod capture;

pub use capture::{CapturedOutput, OutputChunk, StreamKind};

use futures_util::future::join_all;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::config::ExecutorConfig;
use crate::registry::CommandSpec;
use capture::{snapshot, SharedCapture};

/// Floor for how long output readers may keep draining after the process ends.
const MIN_DRAIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Killed,
    SpawnFailed,
}

impl ExecState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecState::Pending | ExecState::Running)
    }

    /// Legal edges of the lifecycle. Timeout and cancellation can also end a request that
    /// is still waiting for an execution slot.
    pub fn can_transition_to(self, next: ExecState) -> bool {
        use ExecState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, SpawnFailed)
                | (Pending, TimedOut)
                | (Pending, Killed)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, Killed)
        )
    }
}

/// Tracks one execution's state and logs each transition.
struct Lifecycle<'a> {
    command: &'a str,
    state: ExecState,
}

impl<'a> Lifecycle<'a> {
    fn new(command: &'a str) -> Self {
        Self {
            command,
            state: ExecState::Pending,
        }
    }

    fn advance(&mut self, next: ExecState) -> ExecState {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!("exec {}: {:?} -> {:?}", self.command, self.state, next);
        self.state = next;
        next
    }
}

/// Raw result of one execution, before formatting.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub state: ExecState,
    pub exit_code: Option<i32>,
    /// Terminating signal when the process did not exit normally (unix).
    pub signal: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
    /// Set for spawn failures and for executor malfunctions while waiting on the process.
    pub error: Option<String>,
}

impl ExecOutcome {
    fn without_process(state: ExecState, started: Instant, error: Option<String>) -> Self {
        Self {
            state,
            exit_code: None,
            signal: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration: started.elapsed(),
            error,
        }
    }

    /// Completed with exit status zero.
    pub fn succeeded(&self) -> bool {
        self.state == ExecState::Completed && self.exit_code == Some(0)
    }
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// Spawns and reaps processes under the configured bounds.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: ExecutorConfig,
    permits: Option<Arc<Semaphore>>,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let permits = config
            .max_concurrent
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        Self { config, permits }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.kill_grace_ms)
    }

    fn command(&self, spec: &CommandSpec, args: &[String]) -> Command {
        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.fixed_args)
            .args(args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.config.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }

    /// Run `spec` with the caller's `args` (fixed args are prepended). `live` receives output
    /// as it is produced; pass it only for commands that allow streaming.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        args: &[String],
        cancel: &CancellationToken,
        live: Option<mpsc::Sender<OutputChunk>>,
    ) -> ExecOutcome {
        let started = Instant::now();
        let deadline = started + spec.timeout;
        let mut life = Lifecycle::new(&spec.name);

        let _permit = match &self.permits {
            None => None,
            Some(sem) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let state = life.advance(ExecState::Killed);
                        return ExecOutcome::without_process(state, started, None);
                    }
                    _ = sleep_until(deadline) => {
                        log::warn!("exec {}: no execution slot before deadline", spec.name);
                        let state = life.advance(ExecState::TimedOut);
                        return ExecOutcome::without_process(state, started, None);
                    }
                    permit = sem.clone().acquire_owned() => match permit {
                        Ok(p) => Some(p),
                        Err(_) => {
                            let state = life.advance(ExecState::SpawnFailed);
                            return ExecOutcome::without_process(
                                state,
                                started,
                                Some("executor is shut down".to_string()),
                            );
                        }
                    },
                }
            }
        };
        if cancel.is_cancelled() {
            let state = life.advance(ExecState::Killed);
            return ExecOutcome::without_process(state, started, None);
        }

        let mut child = match self.command(spec, args).spawn() {
            Ok(c) => c,
            Err(e) => {
                log::warn!("exec {}: spawn of {} failed: {}", spec.name, spec.binary, e);
                let state = life.advance(ExecState::SpawnFailed);
                return ExecOutcome::without_process(
                    state,
                    started,
                    Some(format!("spawn failed: {}", e)),
                );
            }
        };
        life.advance(ExecState::Running);
        let pid = child.id();

        let limit = self.config.max_output_bytes;
        let stdout_buf = SharedCapture::default();
        let stderr_buf = SharedCapture::default();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(capture::capture(
                out,
                StreamKind::Stdout,
                limit,
                stdout_buf.clone(),
                live.clone(),
            )));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(capture::capture(
                err,
                StreamKind::Stderr,
                limit,
                stderr_buf.clone(),
                live,
            )));
        }

        let ended = tokio::select! {
            biased;
            status = child.wait() => Ended::Exited(status),
            _ = sleep_until(deadline) => Ended::Deadline,
            _ = cancel.cancelled() => Ended::Cancelled,
        };

        let (state, status, error) = match ended {
            Ended::Exited(Ok(status)) => (ExecState::Completed, Some(status), None),
            Ended::Exited(Err(e)) => {
                log::error!("exec {}: waiting for process failed: {}", spec.name, e);
                terminate(&mut child, pid, self.grace()).await;
                (
                    ExecState::Killed,
                    None,
                    Some(format!("waiting for process failed: {}", e)),
                )
            }
            Ended::Deadline => {
                log::warn!(
                    "exec {}: timed out after {:?}, terminating process group",
                    spec.name,
                    spec.timeout
                );
                terminate(&mut child, pid, self.grace()).await;
                (ExecState::TimedOut, None, None)
            }
            Ended::Cancelled => {
                log::info!("exec {}: cancelled, terminating process group", spec.name);
                terminate(&mut child, pid, self.grace()).await;
                (ExecState::Killed, None, None)
            }
        };
        life.advance(state);

        let drain = self.grace().max(MIN_DRAIN);
        if state != ExecState::Completed {
            // Members that ignored SIGTERM would keep the pipes open.
            kill_group(pid);
        }
        let mut drained = wait_readers(&mut readers, drain).await;
        if !drained && state == ExecState::Completed {
            // The pipes are held by group members that outlived the leader, so the group id
            // is still in use and cannot have been recycled.
            log::warn!(
                "exec {}: background processes still hold output after exit, killing group",
                spec.name
            );
            kill_group(pid);
            drained = wait_readers(&mut readers, drain).await;
        }
        if !drained {
            log::warn!("exec {}: output readers did not finish, aborting", spec.name);
            for r in &readers {
                r.abort();
            }
        }

        ExecOutcome {
            state,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(exit_signal),
            stdout: snapshot(&stdout_buf),
            stderr: snapshot(&stderr_buf),
            duration: started.elapsed(),
            error,
        }
    }
}

/// Wait for the readers that are still running. False if they outlast `within`.
async fn wait_readers(readers: &mut [JoinHandle<()>], within: Duration) -> bool {
    let pending = readers.iter_mut().filter(|r| !r.is_finished());
    tokio::time::timeout(within, join_all(pending)).await.is_ok()
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn group_of(pid: Option<u32>) -> Option<Pid> {
    pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw)
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pgid) = group_of(pid) {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// SIGTERM the group, wait up to `grace`, then SIGKILL. Always reaps the child.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pgid) = group_of(pid) {
        let _ = killpg(pgid, Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);
    let _ = child.start_kill();
    let _ = child.wait().await;
}
