//! Optional HTTP status server
//!
//! Exposes liveness, readiness, lifecycle phase and Prometheus metrics so
//! that the container runtime can tell "still bootstrapping" apart from
//! "serving traffic".

mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{run_status_server, Phase, StatusState};
pub use metrics::{create_metrics, Metrics, SharedMetrics};
pub use shutdown::{shutdown_channel, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
