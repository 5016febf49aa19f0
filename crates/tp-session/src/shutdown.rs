//! Cooperative shutdown coordination.
//!
//! Long-running components (the supervisor's timer tasks, the PR watcher's
//! poll loop, runner I/O loops) subscribe and `select!` on the returned
//! receiver. The daemon triggers shutdown once, then waits a bounded time
//! for each participant to confirm it has drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drained_tx: Arc<watch::Sender<usize>>,
    drained_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    /// Register interest in the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Cheap non-blocking check.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Fire the signal. Idempotent; only the first call broadcasts.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Confirm one component has finished draining.
    pub fn confirm_drained(&self) {
        self.drained_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain. Returns the number
    /// confirmed, which is less than `expected` on timeout.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *self.drained_rx.borrow();
            if current >= expected {
                return current;
            }
            match tokio::time::timeout_at(deadline, self.drained_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return *self.drained_rx.borrow(),
                Err(_) => {
                    let current = *self.drained_rx.borrow();
                    warn!(current, expected, "drain timeout, continuing shutdown");
                    return current;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that confirms drain when dropped.
pub struct DrainGuard {
    signal: ShutdownSignal,
}

impl DrainGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn clones_share_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_receive_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("signal not received")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let mut signal = ShutdownSignal::new();
        let guard_a = DrainGuard::new(signal.clone());
        let guard_b = DrainGuard::new(signal.clone());
        signal.trigger();

        tokio::spawn(async move {
            drop(guard_a);
            drop(guard_b);
        });

        let confirmed = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(confirmed, 2);
    }

    #[tokio::test]
    async fn drain_times_out_without_confirmation() {
        let mut signal = ShutdownSignal::new();
        signal.trigger();
        let confirmed = signal.wait_for_drain(1, Duration::from_millis(50)).await;
        assert_eq!(confirmed, 0);
    }
}
