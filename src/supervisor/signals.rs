//! Process signal intake
//!
//! Signals are turned into messages on an mpsc channel so the supervisor can
//! select on them alongside the child's exit, and so tests can inject them
//! without touching the real process.
//!
//! Termination class (starts or escalates shutdown): SIGTERM, SIGINT, SIGQUIT.
//! Pass-through (forwarded verbatim, no state change): SIGHUP, SIGUSR1, SIGUSR2.

use nix::sys::signal::Signal;
use tokio::sync::mpsc;

pub type SignalSender = mpsc::UnboundedSender<Signal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

/// Signals that ask the workload to stop
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

/// Signals relayed to the workload unchanged (reload, log reopen, ...)
pub const PASS_THROUGH_SIGNALS: [Signal; 3] = [Signal::SIGHUP, Signal::SIGUSR1, Signal::SIGUSR2];

pub fn is_termination(signal: Signal) -> bool {
    TERMINATION_SIGNALS.contains(&signal)
}

/// Create an injectable signal channel
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Register handlers for all supervised signals
///
/// Each handler runs in its own task and feeds the returned receiver. Fails
/// if a handler cannot be registered, which leaves the container unable to
/// stop gracefully, so callers treat it as a bootstrap failure.
pub fn listen_for_signals() -> std::io::Result<SignalReceiver> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = signal_channel();

    for sig in [TERMINATION_SIGNALS, PASS_THROUGH_SIGNALS].concat() {
        let mut stream = signal(SignalKind::from_raw(sig as i32))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}
