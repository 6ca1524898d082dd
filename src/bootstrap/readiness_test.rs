//! Tests for the readiness gate

use super::*;
use crate::server::create_metrics;
use axum::{http::StatusCode, routing::get, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::net::TcpListener;

/// Probe that fails until a target has been probed `fail_times` times
struct ScriptedProbe {
    fail_times: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
    total: AtomicU32,
}

impl ScriptedProbe {
    fn new(script: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            fail_times: script.iter().map(|(n, f)| (n.to_string(), *f)).collect(),
            calls: Mutex::new(HashMap::new()),
            total: AtomicU32::new(0),
        })
    }

    fn calls_for(&self, name: &str) -> u32 {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, target: &DependencyTarget) -> Result<(), ProbeError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(target.name.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let fail_times = self
            .fail_times
            .get(&target.name)
            .copied()
            .unwrap_or(u32::MAX);
        if call > fail_times {
            Ok(())
        } else {
            Err(ProbeError::Connect("connection refused".to_string()))
        }
    }
}

fn target(name: &str, poll_ms: u64) -> DependencyTarget {
    DependencyTarget::tcp(name, format!("{}:5432", name))
        .with_timing(Duration::from_millis(100), Duration::from_millis(poll_ms))
}

fn gate(probe: Arc<dyn Probe>) -> ReadinessGate {
    ReadinessGate::new(probe, Duration::from_secs(10), create_metrics().unwrap())
}

#[tokio::test]
async fn test_empty_target_list_is_ready_immediately() {
    let probe = ScriptedProbe::new(&[]);
    let result = gate(probe.clone())
        .await_ready(&[], Duration::from_millis(10))
        .await;

    assert!(result.is_ok());
    assert_eq!(probe.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ready_after_retries() {
    let probe = ScriptedProbe::new(&[("db", 2)]);
    let targets = vec![target("db", 10)];

    gate(probe.clone())
        .await_ready(&targets, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(probe.calls_for("db"), 3);
}

/// Three targets each needing ~300ms must finish in ~300ms, not ~900ms
#[tokio::test]
async fn test_targets_are_polled_concurrently() {
    let probe = ScriptedProbe::new(&[("db", 3), ("cache", 3), ("search", 3)]);
    let targets = vec![
        target("db", 100),
        target("cache", 100),
        target("search", 100),
    ];

    let started = std::time::Instant::now();
    gate(probe)
        .await_ready(&targets, Duration::from_secs(5))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(800),
        "expected concurrent polling, took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_timeout_names_only_unreachable_targets() {
    let probe = ScriptedProbe::new(&[("db", 0)]);
    let targets = vec![target("db", 10), target("cache", 10), target("search", 10)];

    let started = std::time::Instant::now();
    let err = gate(probe)
        .await_ready(&targets, Duration::from_millis(300))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    let ReadinessError::DependencyTimeout {
        unreachable,
        timeout,
    } = err;
    assert_eq!(unreachable, vec!["cache".to_string(), "search".to_string()]);
    assert_eq!(timeout, Duration::from_millis(300));
}

#[tokio::test]
async fn test_timeout_message_lists_targets() {
    let probe = ScriptedProbe::new(&[]);
    let targets = vec![target("db", 10)];

    let err = gate(probe)
        .await_ready(&targets, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("db"));
}

#[tokio::test]
async fn test_probe_failures_are_counted() {
    let metrics = create_metrics().unwrap();
    let probe = ScriptedProbe::new(&[("db", 2)]);
    let gate = ReadinessGate::new(probe, Duration::from_secs(10), metrics.clone());

    gate.await_ready(&[target("db", 10)], Duration::from_secs(5))
        .await
        .unwrap();

    let body = metrics.encode().unwrap();
    assert!(body.contains(r#"portier_probe_failures_total{target="db"} 2"#));
}

#[test]
fn test_first_failure_is_always_logged() {
    let mut log = FailureLog::new(Duration::from_secs(10));
    assert!(log.should_log(Instant::now()));
}

#[test]
fn test_repeated_failures_within_interval_log_once() {
    let mut log = FailureLog::new(Duration::from_secs(10));
    let start = Instant::now();

    let decisions: Vec<bool> = (0..20)
        .map(|i| log.should_log(start + Duration::from_millis(i * 250)))
        .collect();

    assert_eq!(decisions.iter().filter(|d| **d).count(), 1);
    assert!(decisions[0]);
}

#[test]
fn test_failure_after_interval_logs_again() {
    let mut log = FailureLog::new(Duration::from_secs(10));
    let start = Instant::now();

    assert!(log.should_log(start));
    assert!(!log.should_log(start + Duration::from_secs(9)));
    assert!(log.should_log(start + Duration::from_secs(10)));
    // The window restarts from the last logged failure
    assert!(!log.should_log(start + Duration::from_secs(15)));
    assert!(log.should_log(start + Duration::from_secs(21)));
}

#[test]
fn test_zero_interval_logs_every_failure() {
    let mut log = FailureLog::new(Duration::ZERO);
    let now = Instant::now();
    assert!(log.should_log(now));
    assert!(log.should_log(now));
}

#[tokio::test]
async fn test_network_probe_tcp_connects_to_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let probe = NetworkProbe::new().unwrap();

    let result = probe
        .probe(&DependencyTarget::tcp("db", addr.to_string()))
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_network_probe_tcp_fails_on_closed_port() {
    // Bind then drop to get a port with nothing listening
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let probe = NetworkProbe::new().unwrap();

    let result = probe
        .probe(&DependencyTarget::tcp("db", addr.to_string()))
        .await;
    assert!(result.is_err());
}

async fn spawn_http() -> String {
    let app = Router::new()
        .route("/ok", get(|| async { StatusCode::OK }))
        .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_network_probe_http_status_decides_readiness() {
    let base = spawn_http().await;
    let probe = NetworkProbe::new().unwrap();

    let ok = probe
        .probe(&DependencyTarget::http("search", format!("{}/ok", base)))
        .await;
    assert!(ok.is_ok());

    let down = probe
        .probe(&DependencyTarget::http("search", format!("{}/down", base)))
        .await;
    assert!(matches!(down, Err(ProbeError::Status(503))));
}
