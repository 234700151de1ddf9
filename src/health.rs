//! Periodic liveness checks of the proxy and backend
//!
//! Each tick asks the control loop to evaluate both processes. A tick is
//! skipped while the previous check has not been picked up yet, so a busy
//! loop (for instance one already recycling the backend) never builds up a
//! backlog of checks and a single down observation leads to a single recovery.

use crate::scheduler::{spawn_ticker, TimerHandle};
use crate::supervisor::{Command, Trigger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct HealthMonitor {
    interval: Duration,
    trigger: Trigger,
    pending: Arc<AtomicBool>,
    last_fired: Option<Instant>,
}

impl HealthMonitor {
    /// `pending` is cleared by the control loop when it takes the check
    pub fn new(interval: Duration, trigger: Trigger, pending: Arc<AtomicBool>) -> Self {
        Self {
            interval,
            trigger,
            pending,
            last_fired: None,
        }
    }

    pub fn spawn(mut self) -> TimerHandle {
        info!(
            interval_secs = self.interval.as_secs(),
            "Health check monitoring started"
        );
        self.pending.store(false, Ordering::SeqCst);
        let interval = self.interval;
        spawn_ticker("health-monitor", interval, move || self.tick())
    }

    fn tick(&mut self) {
        if self.pending.swap(true, Ordering::SeqCst) {
            debug!(
                since_last_ms = self.last_fired.map(|t| t.elapsed().as_millis()),
                "Previous health check still pending, skipping tick"
            );
            return;
        }

        self.last_fired = Some(Instant::now());
        if !self.trigger.send(Command::HealthCheck { reply: None }) {
            self.pending.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unanswered_check_suppresses_further_ticks() {
        let (tx, mut rx) = mpsc::channel(16);
        let pending = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new(
            Duration::from_millis(10),
            Trigger::new(tx.downgrade()),
            Arc::clone(&pending),
        );
        let timer = monitor.spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.cancel();

        let mut checks = 0;
        while let Ok(command) = rx.try_recv() {
            assert!(matches!(command, Command::HealthCheck { .. }));
            checks += 1;
        }
        assert_eq!(checks, 1);
        assert!(pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_answered_checks_keep_flowing() {
        let (tx, mut rx) = mpsc::channel(16);
        let pending = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new(
            Duration::from_millis(10),
            Trigger::new(tx.downgrade()),
            Arc::clone(&pending),
        );
        let timer = monitor.spawn();

        let mut checks = 0;
        while checks < 3 {
            let command = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(command, Command::HealthCheck { .. }));
            pending.store(false, Ordering::SeqCst);
            checks += 1;
        }
        timer.cancel();
    }

    #[tokio::test]
    async fn test_closed_loop_clears_pending() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let pending = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new(
            Duration::from_millis(10),
            Trigger::new(tx.downgrade()),
            Arc::clone(&pending),
        );
        let timer = monitor.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.cancel();
        assert!(!pending.load(Ordering::SeqCst));
        drop(tx);
    }
}
