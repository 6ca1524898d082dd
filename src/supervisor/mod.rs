//! Supervision of the long-running server process
//!
//! The supervisor spawns the server as its foreground child and becomes its
//! signal proxy:
//!
//! ```text
//! Starting -> Running -> Stopping -> Stopped
//!                |           \-----> Killed   (grace period elapsed or second signal)
//!                \-----------------> Stopped  (child exited on its own)
//! ```
//!
//! The child's exit code is preserved verbatim so that the container's exit
//! status is the server's exit status.
//!
//! The child leads its own process group and signals go to the whole group,
//! the way a terminal delivers them. Under `docker run -it` a Ctrl-C then
//! reaches portier only, and the server sees exactly one SIGINT. Helpers the
//! server forks are stopped along with it. A child that reads from the
//! terminal is in a background group and gets SIGTTIN.

pub mod signals;

use crate::config::{CommandSpec, SupervisorConfig};
use crate::server::{Phase, SharedMetrics, StatusState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use signals::{is_termination, SignalReceiver};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Exit code reported when the child was terminated with SIGKILL
pub const KILLED_EXIT_CODE: i32 = 128 + Signal::SIGKILL as i32;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost track of supervised process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Killed,
}

/// Terminal result of supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Child exited without being asked to (crash or normal completion)
    Exited { code: i32 },
    /// Child exited within the grace period after a forwarded signal
    Stopped { signal: Signal, code: i32 },
    /// Child was forcibly killed
    Killed { code: i32 },
}

impl SupervisorOutcome {
    /// Exit code portier itself should exit with
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorOutcome::Exited { code }
            | SupervisorOutcome::Stopped { code, .. }
            | SupervisorOutcome::Killed { code } => *code,
        }
    }
}

/// Seam between the bootstrap sequence and the process it finally starts
#[async_trait]
pub trait ServerLauncher: Send {
    async fn launch(
        &mut self,
        signals: &mut SignalReceiver,
    ) -> Result<SupervisorOutcome, SpawnError>;
}

/// Map an exit status to a shell-style exit code (128 + signal when killed)
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// The running child and what has happened to it so far
struct SupervisedProcess {
    child: Child,
    pid: Option<Pid>,
    started_at: DateTime<Utc>,
    received_signal: Option<Signal>,
}

impl SupervisedProcess {
    fn spawn(command: &CommandSpec) -> Result<Self, SpawnError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);
        Ok(Self {
            child,
            pid,
            started_at: Utc::now(),
            received_signal: None,
        })
    }

    /// Signal the child's process group, or the child alone if it left it
    fn forward(&self, signal: Signal) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        match killpg(pid, signal).or_else(|_| kill(pid, signal)) {
            Ok(()) => true,
            Err(e) => {
                // ESRCH: the child already exited and is waiting to be reaped
                warn!(pid = %pid, signal = %signal, error = %e, "Failed to forward signal");
                false
            }
        }
    }
}

pub struct ServiceSupervisor {
    command: CommandSpec,
    grace_period: Duration,
    state: SupervisorState,
    status: StatusState,
    metrics: SharedMetrics,
}

impl ServiceSupervisor {
    pub fn new(config: SupervisorConfig, status: StatusState, metrics: SharedMetrics) -> Self {
        Self {
            command: config.command,
            grace_period: config.grace_period,
            state: SupervisorState::Starting,
            status,
            metrics,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(from = ?self.state, to = ?next, "Supervisor state change");
        self.state = next;
        let phase = match next {
            SupervisorState::Starting => Phase::Starting,
            SupervisorState::Running => Phase::Running,
            SupervisorState::Stopping => Phase::Stopping,
            SupervisorState::Stopped | SupervisorState::Killed => Phase::Stopped,
        };
        self.status.set_phase(phase);
    }

    /// Spawn `command` and supervise it until it exits
    ///
    /// Returns once the child has been reaped in every path, including after
    /// a forced kill.
    pub async fn run(
        &mut self,
        command: &CommandSpec,
        signals: &mut SignalReceiver,
    ) -> Result<SupervisorOutcome, SpawnError> {
        self.transition(SupervisorState::Starting);

        let mut process = match SupervisedProcess::spawn(command) {
            Ok(p) => p,
            Err(e) => {
                self.status.set_phase(Phase::Failed);
                return Err(e);
            }
        };
        self.transition(SupervisorState::Running);
        info!(
            pid = ?process.pid.map(|p| p.as_raw()),
            command = %command,
            "Server process started"
        );

        let mut grace_deadline: Option<Instant> = None;
        let mut signals_open = true;

        loop {
            tokio::select! {
                status = process.child.wait() => {
                    let status = status.map_err(SpawnError::Wait)?;
                    return Ok(self.finish(&process, status));
                }
                received = signals.recv(), if signals_open => match received {
                    Some(signal) => {
                        self.handle_signal(&mut process, signal, &mut grace_deadline);
                    }
                    None => {
                        debug!("Signal source closed");
                        signals_open = false;
                    }
                },
                _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                    if grace_deadline.is_some() =>
                {
                    warn!(
                        grace_period = ?self.grace_period,
                        "Server did not exit within grace period, killing"
                    );
                    grace_deadline = None;
                    self.force_kill(&mut process);
                }
            }
        }
    }

    fn handle_signal(
        &mut self,
        process: &mut SupervisedProcess,
        signal: Signal,
        grace_deadline: &mut Option<Instant>,
    ) {
        if !is_termination(signal) {
            info!(signal = %signal, "Forwarding signal to server");
            if process.forward(signal) {
                self.metrics.record_signal_forwarded(signal.as_str());
            }
            return;
        }

        match self.state {
            SupervisorState::Running => {
                info!(
                    signal = %signal,
                    grace_period = ?self.grace_period,
                    "Stopping server"
                );
                process.received_signal = Some(signal);
                if process.forward(signal) {
                    self.metrics.record_signal_forwarded(signal.as_str());
                }
                *grace_deadline = Some(Instant::now() + self.grace_period);
                self.transition(SupervisorState::Stopping);
            }
            SupervisorState::Stopping => {
                warn!(signal = %signal, "Repeated termination signal, killing server now");
                *grace_deadline = None;
                self.force_kill(process);
            }
            SupervisorState::Starting | SupervisorState::Stopped | SupervisorState::Killed => {
                debug!(signal = %signal, state = ?self.state, "Ignoring signal");
            }
        }
    }

    fn force_kill(&mut self, process: &mut SupervisedProcess) {
        if let Some(pid) = process.pid {
            if let Err(e) = killpg(pid, Signal::SIGKILL) {
                debug!(pid = %pid, error = %e, "Failed to kill server process group");
            }
        }
        if let Err(e) = process.child.start_kill() {
            // Only fails when the child has already exited
            warn!(error = %e, "Failed to kill server process");
        }
        self.metrics
            .record_signal_forwarded(Signal::SIGKILL.as_str());
        self.transition(SupervisorState::Killed);
    }

    fn finish(&mut self, process: &SupervisedProcess, status: ExitStatus) -> SupervisorOutcome {
        let code = exit_code_of(status);
        let uptime = Utc::now() - process.started_at;
        self.metrics.set_child_exit_code(code);

        let outcome = match (self.state, process.received_signal) {
            (SupervisorState::Killed, _) => SupervisorOutcome::Killed { code },
            (SupervisorState::Stopping, Some(signal)) => {
                self.transition(SupervisorState::Stopped);
                SupervisorOutcome::Stopped { signal, code }
            }
            _ => {
                self.transition(SupervisorState::Stopped);
                SupervisorOutcome::Exited { code }
            }
        };

        match outcome {
            SupervisorOutcome::Exited { code: 0 } | SupervisorOutcome::Stopped { .. } => info!(
                exit_code = code,
                uptime_secs = uptime.num_seconds(),
                outcome = ?outcome,
                "Server process exited"
            ),
            _ => error!(
                exit_code = code,
                uptime_secs = uptime.num_seconds(),
                outcome = ?outcome,
                "Server process exited abnormally"
            ),
        }

        outcome
    }
}

#[async_trait]
impl ServerLauncher for ServiceSupervisor {
    async fn launch(
        &mut self,
        signals: &mut SignalReceiver,
    ) -> Result<SupervisorOutcome, SpawnError> {
        let command = self.command.clone();
        self.run(&command, signals).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "supervisor_test.rs"]
mod tests;
