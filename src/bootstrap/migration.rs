//! Schema migrations, run exactly once per container start
//!
//! The migration command is an opaque collaborator: exit code 0 means the
//! schema is up to date, anything else is a hard stop. Output is captured
//! for diagnostics only and never parsed. Failures are never retried here;
//! the next container start is the retry.
//!
//! The command runs in its own process group. A terminal Ctrl-C therefore
//! never reaches it directly, and a timeout kills the whole group, including
//! any helpers it started.

use crate::config::{CommandSpec, MigrationConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Captured output is truncated to its last this-many bytes
pub const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

/// How long to keep reading output once the command is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration command exited with code {exit_code}")]
    Failed {
        exit_code: i32,
        captured_output: String,
    },

    #[error("failed to run migration command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("migration command did not finish within {timeout:?}")]
    TimedOut {
        timeout: Duration,
        captured_output: String,
    },
}

/// Record of the single migration run of this start
#[derive(Debug, Clone)]
pub struct MigrationAttempt {
    pub command: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub output: String,
}

#[async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn apply_migrations(&self) -> Result<MigrationAttempt, MigrationError>;
}

/// Runs the configured migration command as a subprocess
pub struct CommandMigrationRunner {
    command: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandMigrationRunner {
    pub fn new(command: CommandSpec, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }

    /// `None` when the configuration disables migrations
    pub fn from_config(config: &MigrationConfig) -> Option<Self> {
        config
            .command
            .clone()
            .map(|command| Self::new(command, config.timeout))
    }
}

#[async_trait]
impl MigrationRunner for CommandMigrationRunner {
    async fn apply_migrations(&self) -> Result<MigrationAttempt, MigrationError> {
        let command = self.command.to_string();
        info!(command = %command, timeout = ?self.timeout, "Applying migrations");

        let started_at = Utc::now();
        let started = Instant::now();
        let spawn_error = |source| MigrationError::Spawn {
            command: command.clone(),
            source,
        };

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let output = OutputBuffer::default();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(output.collect(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(output.collect(stderr));
        }

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    kill_group(&mut child).await;
                    let captured_output = output.finish(readers).await;
                    error!(
                        command = %command,
                        timeout = ?limit,
                        output = %captured_output,
                        "Migration timed out, killed"
                    );
                    return Err(MigrationError::TimedOut {
                        timeout: limit,
                        captured_output,
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(spawn_error)?;

        let exit_code = crate::supervisor::exit_code_of(status);
        let captured_output = output.finish(readers).await;
        let duration = started.elapsed();

        if exit_code != 0 {
            error!(
                command = %command,
                exit_code,
                duration_ms = duration.as_millis() as u64,
                output = %captured_output,
                "Migrations failed"
            );
            return Err(MigrationError::Failed {
                exit_code,
                captured_output,
            });
        }

        debug!(output = %captured_output, "Migration output");
        info!(
            command = %command,
            duration_ms = duration.as_millis() as u64,
            "Migrations applied"
        );

        Ok(MigrationAttempt {
            command,
            exit_code,
            started_at,
            duration,
            output: captured_output,
        })
    }
}

/// SIGKILL the command's process group, then reap the command itself
async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, error = %e, "Failed to kill migration process group");
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill migration command");
    }
    let _ = child.wait().await;
}

/// stdout and stderr of the command, interleaved in arrival order
#[derive(Clone, Default)]
struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    /// Copy a pipe into the buffer until it closes
    fn collect<R>(&self, mut pipe: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.0.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buffer = buffer.lock().await;
                        buffer.extend_from_slice(&chunk[..n]);
                        // Bound memory for chatty commands, tail() trims the rest
                        if buffer.len() > 2 * MAX_CAPTURED_OUTPUT {
                            let excess = buffer.len() - MAX_CAPTURED_OUTPUT;
                            buffer.drain(..excess);
                        }
                    }
                }
            }
        })
    }

    /// Wait briefly for the readers, then return the captured tail
    ///
    /// A process outside the group may still hold a pipe open, so readers
    /// that outlive the drain timeout are abandoned.
    async fn finish(&self, mut readers: Vec<JoinHandle<()>>) -> String {
        let drained = futures::future::join_all(readers.iter_mut());
        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained).await;
        if drained.is_err() {
            debug!("Migration output still open, keeping what was read");
        }
        for reader in &readers {
            reader.abort();
        }
        let buffer = self.0.lock().await;
        tail(&buffer, MAX_CAPTURED_OUTPUT)
    }
}

/// Keep the last `limit` bytes, lossily decoded
fn tail(bytes: &[u8], limit: usize) -> String {
    let start = bytes.len().saturating_sub(limit);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
