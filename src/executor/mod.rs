//! Command executor: validation, spawn, bounded wait, cancellation.
//!
//! Each `execute` call runs one shell command line to completion (or
//! timeout) on the calling task. Running jobs are tracked in the
//! [`JobRegistry`] so that `stop` can reach them from another request.

mod capture;
pub mod registry;

use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::AgentError;
use crate::policy::{base_command, PolicyValidator};
use capture::Capture;
pub use registry::{JobRegistry, JobStatus, JobSummary};

/// Upper bound on a job's timeout (one year); larger requests are clamped.
const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Outcome of one `execute` call, serialized as the `/execute` response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failure(err: &AgentError, job_id: Option<u64>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            job_id,
            error: Some(err.to_string()),
        }
    }
}

/// Outcome of a `stop` call, serialized as the `/stop` response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StopResult {
    pub success: bool,
    pub message: String,
}

pub struct Executor {
    policy: Arc<PolicyValidator>,
    registry: JobRegistry,
    shell: String,
    drain_grace: Duration,
    stop_grace: Duration,
    output_limit: usize,
}

impl Executor {
    pub fn new(policy: Arc<PolicyValidator>, config: &ExecutorConfig) -> Self {
        Self {
            policy,
            registry: JobRegistry::new(),
            shell: config.shell.clone(),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
            output_limit: config.max_output_bytes,
        }
    }

    pub fn policy(&self) -> &PolicyValidator {
        &self.policy
    }

    #[cfg(test)]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Runs `command` through the shell, bounded by `timeout`.
    ///
    /// Never fails: policy rejections, spawn errors, timeouts and wait
    /// errors are all reported in the returned result.
    pub async fn execute(&self, command: &str, timeout: Duration) -> ExecutionResult {
        if !self.policy.check(command) {
            let err = AgentError::PolicyRejected {
                command: base_command(command).unwrap_or_default().to_string(),
                preview: self.policy.preview(),
            };
            warn!("Rejected command: {command:?}");
            return ExecutionResult::failure(&err, None);
        }

        let mut child = match self.spawn(command) {
            Ok(child) => child,
            Err(e) => {
                error!("{e}");
                return ExecutionResult::failure(&e, None);
            }
        };
        // The child leads its own group, so the group id is its pid.
        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);

        let (job_id, stop) = self.registry.register(command, child.id());
        let registration = Registration {
            registry: &self.registry,
            job_id,
        };
        info!("[job {job_id}] Running: {command}");

        let outcome = self
            .supervise(job_id, &mut child, pgid, &stop, timeout)
            .await;
        drop(registration);

        match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("[job {job_id}] {e}");
                ExecutionResult::failure(&e, Some(job_id))
            }
        }
    }

    /// Asks the job's waiting task to terminate its process.
    ///
    /// Returns as soon as the request is recorded; the process exit and
    /// the registry cleanup are observed by the pending `execute`.
    pub fn stop(&self, job_id: u64) -> StopResult {
        if self.registry.request_stop(job_id) {
            info!("[job {job_id}] Stop requested");
            StopResult {
                success: true,
                message: format!("Process {job_id} terminated"),
            }
        } else {
            let err = AgentError::NotFound { job_id };
            debug!("Stop ignored: {err}");
            StopResult {
                success: false,
                message: err.to_string(),
            }
        }
    }

    /// Stops every running job, and any job registered afterwards.
    ///
    /// Returns the number of jobs that were running.
    pub fn shutdown(&self) -> usize {
        let ids = self.registry.request_stop_all();
        if !ids.is_empty() {
            info!("Stopping {} running job(s): {ids:?}", ids.len());
        }
        ids.len()
    }

    /// Running jobs, ordered by id.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.registry.snapshot()
    }

    fn spawn(&self, command: &str) -> Result<Child, AgentError> {
        Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so signals also reach the shell's children
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::SpawnFailure)
    }

    /// Waits for the job to finish, a stop request or the deadline.
    ///
    /// A job is finished once the shell has exited and both pipes are
    /// closed: background children holding a pipe still belong to it,
    /// and stop and timeout keep applying to them.
    async fn supervise(
        &self,
        job_id: u64,
        child: &mut Child,
        pgid: Option<Pid>,
        stop: &Notify,
        timeout: Duration,
    ) -> Result<ExecutionResult, AgentError> {
        let timeout = timeout.min(MAX_TIMEOUT);
        let mut stdout = Capture::spawn(child.stdout.take(), self.output_limit);
        let mut stderr = Capture::spawn(child.stderr.take(), self.output_limit);
        // Fires at the deadline, or `stop_grace` after a stop request
        let kill_at = tokio::time::sleep_until(Instant::now() + timeout);
        tokio::pin!(kill_at);
        let mut stopped = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => break Some(status),
                    Err(e) => {
                        signal_group(pgid, Signal::SIGKILL, job_id);
                        return Err(AgentError::Wait(e));
                    }
                },
                _ = stop.notified(), if !stopped => {
                    stopped = true;
                    self.begin_stop(job_id, pgid, kill_at.as_mut());
                }
                _ = &mut kill_at => break None,
            }
        };

        let drained = match status {
            Some(_) => {
                let pipes_closed = async { tokio::join!(stdout.closed(), stderr.closed()) };
                tokio::pin!(pipes_closed);
                loop {
                    tokio::select! {
                        _ = &mut pipes_closed => break true,
                        _ = stop.notified(), if !stopped => {
                            stopped = true;
                            self.begin_stop(job_id, pgid, kill_at.as_mut());
                        }
                        _ = &mut kill_at => break false,
                    }
                }
            }
            None => false,
        };

        if !drained {
            if stopped {
                warn!("[job {job_id}] Still running {:?} after SIGTERM, killing", self.stop_grace);
            } else {
                warn!("[job {job_id}] Timed out after {}s, killing", timeout.as_secs());
            }
            signal_group(pgid, Signal::SIGKILL, job_id);
            if status.is_none() {
                if let Err(e) = child.kill().await {
                    debug!("[job {job_id}] kill: {e}");
                }
            }
        }

        let stdout = stdout.finish(self.drain_grace).await;
        let stderr = stderr.finish(self.drain_grace).await;

        let (final_status, error) = match status {
            _ if stopped => (JobStatus::Killed, Some(format!("Process {job_id} was stopped"))),
            Some(status) if drained => describe_exit(status),
            _ => {
                let err = AgentError::Timeout {
                    seconds: timeout.as_secs(),
                };
                (JobStatus::TimedOut, Some(err.to_string()))
            }
        };
        let exit_code = match final_status {
            JobStatus::TimedOut => None,
            _ => status.and_then(|s| s.code()),
        };
        info!("[job {job_id}] {final_status} (exit code: {exit_code:?})");

        Ok(ExecutionResult {
            success: final_status == JobStatus::Completed,
            stdout,
            stderr,
            exit_code,
            job_id: Some(job_id),
            error,
        })
    }

    /// Sends SIGTERM to the job's group and brings the SIGKILL forward
    /// to `stop_grace` from now.
    fn begin_stop(&self, job_id: u64, pgid: Option<Pid>, kill_at: Pin<&mut Sleep>) {
        signal_group(pgid, Signal::SIGTERM, job_id);
        let escalate = Instant::now() + self.stop_grace;
        if escalate < kill_at.deadline() {
            kill_at.reset(escalate);
        }
    }
}

/// Removes the job from the registry when dropped, so every terminal
/// path (including a cancelled `execute` future) deregisters exactly once.
struct Registration<'a> {
    registry: &'a JobRegistry,
    job_id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.registry.deregister(self.job_id).is_none() {
            debug!("[job {}] already removed from registry", self.job_id);
        }
    }
}

/// Maps a process exit to the job's terminal state and optional error text.
fn describe_exit(status: ExitStatus) -> (JobStatus, Option<String>) {
    if let Some(sig) = status.signal() {
        (
            JobStatus::Failed,
            Some(format!("Process terminated by signal {sig}")),
        )
    } else if status.success() {
        (JobStatus::Completed, None)
    } else {
        (JobStatus::Failed, None)
    }
}

/// Signals the job's process group.
///
/// Only called while the job is unfinished: a pipe still open or the
/// shell unreaped means a group member is alive, which keeps the group
/// id from being reused.
fn signal_group(pgid: Option<Pid>, signal: Signal, job_id: u64) {
    let Some(pgid) = pgid else {
        warn!("[job {job_id}] no process group, not sending {signal:?}");
        return;
    };
    match killpg(pgid, signal) {
        Ok(()) => debug!("[job {job_id}] sent {signal:?} to group {pgid}"),
        Err(Errno::ESRCH) => debug!("[job {job_id}] group {pgid} already gone"),
        Err(e) => warn!("[job {job_id}] failed to send {signal:?}: {e}"),
    }
}
