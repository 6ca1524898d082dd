//! Bootstrap sequence: readiness gate, migrations, then the server
//!
//! The three stages run strictly in order. Migrations never start before
//! every dependency answered, and the server never starts unless migrations
//! succeeded. Any stage failure aborts the whole start; retrying is left to
//! the container orchestrator's restart policy.

pub mod migration;
pub mod readiness;

use crate::config::{ConfigError, DependencyTarget};
use crate::server::{Phase, SharedMetrics, StatusState};
use crate::supervisor::signals::{is_termination, SignalReceiver};
use crate::supervisor::{ServerLauncher, SpawnError, SupervisorOutcome};
use migration::{MigrationError, MigrationRunner};
use nix::sys::signal::Signal;
use readiness::{ReadinessError, ReadinessGate};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exit code for invalid configuration (EX_CONFIG)
pub const EXIT_CONFIG: i32 = 78;
/// Exit code when dependencies never became ready (EX_UNAVAILABLE)
pub const EXIT_DEPENDENCY_TIMEOUT: i32 = 69;
/// Exit code when migrations failed (EX_SOFTWARE)
pub const EXIT_MIGRATION_FAILED: i32 = 70;
/// Exit code when the server could not be spawned (EX_OSERR)
pub const EXIT_SPAWN_FAILED: i32 = 71;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    DependencyTimeout(#[from] ReadinessError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("interrupted by {0} before the server started")]
    Interrupted(Signal),
}

impl BootstrapError {
    /// Stage name used in logs so operators can tell infra from app failures
    pub fn stage(&self) -> &'static str {
        match self {
            BootstrapError::Config(_) => "config",
            BootstrapError::DependencyTimeout(_) => "readiness",
            BootstrapError::Migration(_) => "migration",
            BootstrapError::Spawn(_) => "spawn",
            BootstrapError::Interrupted(_) => "interrupted",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Config(_) => EXIT_CONFIG,
            BootstrapError::DependencyTimeout(_) => EXIT_DEPENDENCY_TIMEOUT,
            BootstrapError::Migration(_) => EXIT_MIGRATION_FAILED,
            BootstrapError::Spawn(_) => EXIT_SPAWN_FAILED,
            BootstrapError::Interrupted(signal) => 128 + *signal as i32,
        }
    }
}

/// The full start sequence, assembled from explicit components
pub struct Bootstrap {
    targets: Vec<DependencyTarget>,
    readiness_timeout: Duration,
    gate: ReadinessGate,
    migrations: Option<Box<dyn MigrationRunner>>,
    launcher: Box<dyn ServerLauncher>,
    status: StatusState,
    metrics: SharedMetrics,
}

impl Bootstrap {
    pub fn new(
        targets: Vec<DependencyTarget>,
        readiness_timeout: Duration,
        gate: ReadinessGate,
        migrations: Option<Box<dyn MigrationRunner>>,
        launcher: Box<dyn ServerLauncher>,
        status: StatusState,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            targets,
            readiness_timeout,
            gate,
            migrations,
            launcher,
            status,
            metrics,
        }
    }

    /// Run every stage and return the supervised server's outcome
    pub async fn run(
        &mut self,
        signals: &mut SignalReceiver,
    ) -> Result<SupervisorOutcome, BootstrapError> {
        let result = self.run_stages(signals).await;
        if result.is_err() {
            self.status.set_phase(Phase::Failed);
        }
        result
    }

    async fn run_stages(
        &mut self,
        signals: &mut SignalReceiver,
    ) -> Result<SupervisorOutcome, BootstrapError> {
        self.status.set_phase(Phase::WaitingForDependencies);
        let started = Instant::now();
        self.await_dependencies(signals).await?;
        self.metrics
            .observe_phase(Phase::WaitingForDependencies.as_str(), started.elapsed());

        if let Some(runner) = &self.migrations {
            check_termination(signals, "migrations")?;
            self.status.set_phase(Phase::Migrating);
            let started = Instant::now();
            let interrupted = apply_migrations(runner.as_ref(), signals, &self.metrics).await?;
            self.metrics
                .observe_phase(Phase::Migrating.as_str(), started.elapsed());
            if let Some(signal) = interrupted {
                return Err(BootstrapError::Interrupted(signal));
            }
        } else {
            info!("Migrations disabled, skipping");
        }

        check_termination(signals, "server")?;
        let started = Instant::now();
        let outcome = self.launcher.launch(signals).await?;
        self.metrics
            .observe_phase(Phase::Running.as_str(), started.elapsed());
        Ok(outcome)
    }

    /// Readiness gate, abandoned as soon as a termination signal arrives
    ///
    /// Signals are polled first so one that is already queued when the gate
    /// opens still wins.
    async fn await_dependencies(
        &self,
        signals: &mut SignalReceiver,
    ) -> Result<(), BootstrapError> {
        let ready = self.gate.await_ready(&self.targets, self.readiness_timeout);
        tokio::pin!(ready);
        let mut signals_open = true;

        loop {
            tokio::select! {
                biased;

                received = signals.recv(), if signals_open => match received {
                    Some(signal) if is_termination(signal) => {
                        warn!(
                            signal = %signal,
                            "Termination requested while waiting for dependencies"
                        );
                        return Err(BootstrapError::Interrupted(signal));
                    }
                    Some(signal) => {
                        debug!(signal = %signal, "Ignoring signal, no server running yet");
                    }
                    None => signals_open = false,
                },
                result = &mut ready => return Ok(result?),
            }
        }
    }
}

/// Fail with `Interrupted` if a termination signal is already queued
///
/// Closes the gap between one stage finishing and the next one starting.
/// Pass-through signals drained here have nowhere to go and are dropped.
fn check_termination(signals: &mut SignalReceiver, next: &str) -> Result<(), BootstrapError> {
    while let Ok(signal) = signals.try_recv() {
        if is_termination(signal) {
            warn!(signal = %signal, next, "Termination requested, not starting next stage");
            return Err(BootstrapError::Interrupted(signal));
        }
        debug!(signal = %signal, "Ignoring signal between stages");
    }
    Ok(())
}

/// Run migrations to completion, deferring any termination signal
///
/// A migration is never interrupted half-way. Returns the signal received
/// while it ran, if any, so the caller can skip starting the server.
async fn apply_migrations(
    runner: &dyn MigrationRunner,
    signals: &mut SignalReceiver,
    metrics: &SharedMetrics,
) -> Result<Option<Signal>, BootstrapError> {
    let run = runner.apply_migrations();
    tokio::pin!(run);
    let mut interrupted = None;
    let mut signals_open = true;

    loop {
        tokio::select! {
            biased;

            received = signals.recv(), if signals_open => match received {
                Some(signal) if is_termination(signal) => {
                    warn!(
                        signal = %signal,
                        "Termination requested during migrations, stopping once they finish"
                    );
                    interrupted.get_or_insert(signal);
                }
                Some(signal) => debug!(signal = %signal, "Ignoring signal during migrations"),
                None => signals_open = false,
            },
            result = &mut run => {
                return match result {
                    Ok(attempt) => {
                        metrics.set_migration_exit_code(attempt.exit_code);
                        Ok(interrupted)
                    }
                    Err(e) => {
                        if let MigrationError::Failed { exit_code, .. } = &e {
                            metrics.set_migration_exit_code(*exit_code);
                        }
                        Err(e.into())
                    }
                };
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "bootstrap_test.rs"]
mod tests;
