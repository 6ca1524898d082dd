use anyhow::Context;
use portier::bootstrap::migration::{CommandMigrationRunner, MigrationRunner};
use portier::bootstrap::readiness::{NetworkProbe, ReadinessGate};
use portier::bootstrap::{Bootstrap, BootstrapError, EXIT_SPAWN_FAILED};
use portier::config::{Config, LogFormat};
use portier::server::{create_metrics, run_status_server, shutdown_channel, StatusState};
use portier::supervisor::signals::listen_for_signals;
use portier::supervisor::ServiceSupervisor;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Setup failures (signal handlers, HTTP client, metrics registry) are
/// environment defects, reported like a failed spawn
const EXIT_SETUP_FAILED: i32 = EXIT_SPAWN_FAILED;

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Clamp an exit code to what a process can actually report
fn exit_status_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env(argv);

    init_tracing(config.as_ref().map(|c| c.log_format).unwrap_or_default());

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            let err = BootstrapError::from(e);
            error!(stage = err.stage(), error = %err, "Bootstrap failed");
            return ExitCode::from(exit_status_byte(err.exit_code()));
        }
    };

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(stage = "setup", error = ?e, "Bootstrap failed");
            EXIT_SETUP_FAILED
        }
    };
    ExitCode::from(exit_status_byte(code))
}

async fn run(config: Config) -> anyhow::Result<i32> {
    info!(
        targets = config.readiness.targets.len(),
        migrations = config.migration.command.is_some(),
        server = %config.supervisor.command,
        "Starting portier"
    );

    // Registered first so a stop request is never lost during bootstrap
    let mut signals = listen_for_signals().context("failed to register signal handlers")?;

    let status = StatusState::new();
    let metrics = create_metrics().context("failed to create metrics registry")?;

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let status_handle = config.status_port.map(|port| {
        let status = status.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(port, status, metrics, shutdown_signal).await {
                warn!(error = %e, "Status server failed");
            }
        })
    });

    let probe = NetworkProbe::new().context("failed to build HTTP probe client")?;
    let gate = ReadinessGate::new(
        Arc::new(probe),
        config.readiness.log_interval,
        metrics.clone(),
    );
    let migrations = CommandMigrationRunner::from_config(&config.migration)
        .map(|runner| Box::new(runner) as Box<dyn MigrationRunner>);
    let supervisor = ServiceSupervisor::new(config.supervisor, status.clone(), metrics.clone());

    let mut bootstrap = Bootstrap::new(
        config.readiness.targets,
        config.readiness.overall_timeout,
        gate,
        migrations,
        Box::new(supervisor),
        status,
        metrics,
    );

    let code = match bootstrap.run(&mut signals).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, exit_code = outcome.exit_code(), "Supervision finished");
            outcome.exit_code()
        }
        Err(e) => {
            error!(stage = e.stage(), exit_code = e.exit_code(), error = %e, "Bootstrap failed");
            e.exit_code()
        }
    };

    shutdown_controller.shutdown();
    if let Some(handle) = status_handle {
        let _ = handle.await;
    }

    Ok(code)
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
