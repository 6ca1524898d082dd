//! Prometheus metrics for the bootstrap and supervision lifecycle

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub type SharedMetrics = Arc<Metrics>;

/// Metrics registry plus the handful of collectors portier updates
pub struct Metrics {
    registry: Registry,
    phase_duration: HistogramVec,
    probe_failures: IntCounterVec,
    signals_forwarded: IntCounterVec,
    migration_exit_code: IntGauge,
    child_exit_code: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let phase_duration = HistogramVec::new(
            HistogramOpts::new(
                "portier_phase_duration_seconds",
                "Time spent in each bootstrap phase",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
            &["phase"],
        )?;
        let probe_failures = IntCounterVec::new(
            Opts::new(
                "portier_probe_failures_total",
                "Failed readiness probes per dependency target",
            ),
            &["target"],
        )?;
        let signals_forwarded = IntCounterVec::new(
            Opts::new(
                "portier_signals_forwarded_total",
                "Signals forwarded to the supervised server",
            ),
            &["signal"],
        )?;
        let migration_exit_code = IntGauge::new(
            "portier_migration_exit_code",
            "Exit code of the last migration run (-1 before it finishes)",
        )?;
        let child_exit_code = IntGauge::new(
            "portier_child_exit_code",
            "Exit code of the supervised server (-1 while running)",
        )?;
        migration_exit_code.set(-1);
        child_exit_code.set(-1);

        registry.register(Box::new(phase_duration.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(signals_forwarded.clone()))?;
        registry.register(Box::new(migration_exit_code.clone()))?;
        registry.register(Box::new(child_exit_code.clone()))?;

        Ok(Self {
            registry,
            phase_duration,
            probe_failures,
            signals_forwarded,
            migration_exit_code,
            child_exit_code,
        })
    }

    pub fn observe_phase(&self, phase: &str, elapsed: Duration) {
        self.phase_duration
            .with_label_values(&[phase])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_probe_failure(&self, target: &str) {
        self.probe_failures.with_label_values(&[target]).inc();
    }

    pub fn record_signal_forwarded(&self, signal: &str) {
        self.signals_forwarded.with_label_values(&[signal]).inc();
    }

    pub fn set_migration_exit_code(&self, code: i32) {
        self.migration_exit_code.set(i64::from(code));
    }

    pub fn set_child_exit_code(&self, code: i32) {
        self.child_exit_code.set(i64::from(code));
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(Metrics::new()?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = create_metrics().unwrap();
        metrics.record_probe_failure("database");
        metrics.observe_phase("migrating", Duration::from_millis(1200));
        metrics.record_signal_forwarded("SIGTERM");

        let body = metrics.encode().unwrap();
        assert!(body.contains(r#"portier_probe_failures_total{target="database"} 1"#));
        assert!(body.contains("portier_phase_duration_seconds_bucket"));
        assert!(body.contains(r#"portier_signals_forwarded_total{signal="SIGTERM"} 1"#));
    }

    #[test]
    fn test_exit_code_gauges_start_unset() {
        let metrics = create_metrics().unwrap();
        let body = metrics.encode().unwrap();
        assert!(body.contains("portier_child_exit_code -1"));
        assert!(body.contains("portier_migration_exit_code -1"));

        metrics.set_child_exit_code(7);
        assert!(metrics.encode().unwrap().contains("portier_child_exit_code 7"));
    }
}
