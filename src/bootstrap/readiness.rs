//! Readiness gate for dependent services
//!
//! Every target is polled concurrently, so the total wait is bounded by the
//! slowest single target and by the overall timeout, never by the sum of the
//! individual waits. There is no partial success: either all targets answer
//! before the deadline or the gate fails naming the ones that did not.

use crate::config::{DependencyTarget, Protocol};
use crate::server::SharedMetrics;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("dependencies not ready after {timeout:?}: {}", unreachable.join(", "))]
    DependencyTimeout {
        unreachable: Vec<String>,
        timeout: Duration,
    },
}

/// One connection attempt against one target
///
/// Production code uses `NetworkProbe`. Tests substitute scripted probes.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &DependencyTarget) -> Result<(), ProbeError>;
}

/// TCP connect or HTTP GET, bounded by the target's probe timeout
pub struct NetworkProbe {
    http: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Probe for NetworkProbe {
    async fn probe(&self, target: &DependencyTarget) -> Result<(), ProbeError> {
        let attempt = async {
            match target.protocol {
                Protocol::Tcp => TcpStream::connect(&target.address)
                    .await
                    .map(drop)
                    .map_err(|e| ProbeError::Connect(e.to_string())),
                Protocol::Http => {
                    let response = self
                        .http
                        .get(&target.address)
                        .send()
                        .await
                        .map_err(|e| ProbeError::Connect(e.to_string()))?;
                    let status = response.status();
                    // Redirects count: the service is up and answering
                    if status.is_success() || status.is_redirection() {
                        Ok(())
                    } else {
                        Err(ProbeError::Status(status.as_u16()))
                    }
                }
            }
        };

        tokio::time::timeout(target.probe_timeout, attempt)
            .await
            .map_err(|_| ProbeError::Timeout(target.probe_timeout))?
    }
}

pub struct ReadinessGate {
    probe: Arc<dyn Probe>,
    log_interval: Duration,
    metrics: SharedMetrics,
}

impl ReadinessGate {
    pub fn new(probe: Arc<dyn Probe>, log_interval: Duration, metrics: SharedMetrics) -> Self {
        Self {
            probe,
            log_interval,
            metrics,
        }
    }

    /// Wait until every target answers, or fail once `overall_timeout` elapses
    ///
    /// Cancel-safe: dropping the returned future abandons all probes.
    pub async fn await_ready(
        &self,
        targets: &[DependencyTarget],
        overall_timeout: Duration,
    ) -> Result<(), ReadinessError> {
        if targets.is_empty() {
            info!("No dependency targets configured, skipping readiness gate");
            return Ok(());
        }

        let started = Instant::now();
        let deadline = started + overall_timeout;
        let mut ready = vec![false; targets.len()];

        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .enumerate()
            .map(|(index, target)| async move {
                self.wait_for(target, started).await;
                index
            })
            .collect();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(index)) => ready[index] = true,
                Ok(None) => break,
                Err(_) => {
                    let unreachable: Vec<String> = targets
                        .iter()
                        .zip(&ready)
                        .filter(|(_, ok)| !**ok)
                        .map(|(t, _)| t.name.clone())
                        .collect();
                    warn!(
                        unreachable = ?unreachable,
                        timeout = ?overall_timeout,
                        "Dependencies did not become ready in time"
                    );
                    return Err(ReadinessError::DependencyTimeout {
                        unreachable,
                        timeout: overall_timeout,
                    });
                }
            }
        }

        info!(
            targets = targets.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "All dependencies ready"
        );
        Ok(())
    }

    /// Poll one target until it answers
    async fn wait_for(&self, target: &DependencyTarget, started: Instant) {
        let mut attempts: u64 = 0;
        let mut failures = FailureLog::new(self.log_interval);

        loop {
            attempts += 1;
            match self.probe.probe(target).await {
                Ok(()) => {
                    info!(
                        dependency = %target.name,
                        address = %target.address,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Dependency ready"
                    );
                    return;
                }
                Err(e) => {
                    self.metrics.record_probe_failure(&target.name);
                    if failures.should_log(Instant::now()) {
                        warn!(
                            dependency = %target.name,
                            address = %target.address,
                            protocol = %target.protocol,
                            attempts,
                            error = %e,
                            "Dependency not ready yet"
                        );
                    }
                }
            }
            tokio::time::sleep(target.poll_interval).await;
        }
    }
}

/// Rate limit for one target's failure logs
///
/// The first failure is always logged, later ones at most once per interval.
#[derive(Debug)]
struct FailureLog {
    interval: Duration,
    last_logged: Option<Instant>,
}

impl FailureLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: None,
        }
    }

    /// Record a failure at `now`, returning whether it should be logged
    fn should_log(&mut self, now: Instant) -> bool {
        let due = self
            .last_logged
            .is_none_or(|at| now.saturating_duration_since(at) >= self.interval);
        if due {
            self.last_logged = Some(now);
        }
        due
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "readiness_test.rs"]
mod tests;
