//! Interval timers and the scheduled backend recycle
//!
//! Timers only enqueue triggers for the supervisor's control loop; they never
//! touch process state themselves.

use crate::supervisor::{Command, RecycleTrigger, Trigger};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A running interval task that can be cancelled
pub struct TimerHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the timer; no further ticks fire after this returns
    pub fn cancel(self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
        debug!(timer = self.name, "Timer cancelled");
    }
}

/// Call `on_tick` every `period`, starting one period from now
pub fn spawn_ticker<F>(name: &'static str, period: Duration, mut on_tick: F) -> TimerHandle
where
    F: FnMut() + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => on_tick(),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    TimerHandle {
        name,
        shutdown_tx,
        task,
    }
}

/// Recycles the backend on a fixed period regardless of its health
///
/// Bounds the backend's cumulative request count so it never reaches its
/// internal request ceiling in the middle of serving traffic.
pub struct RestartScheduler {
    period: Duration,
    trigger: Trigger,
    last_fired: Option<Instant>,
}

impl RestartScheduler {
    pub fn new(period: Duration, trigger: Trigger) -> Self {
        Self {
            period,
            trigger,
            last_fired: None,
        }
    }

    pub fn spawn(mut self) -> TimerHandle {
        info!(
            interval_mins = self.period.as_secs() / 60,
            "Backend recycle scheduled"
        );
        let period = self.period;
        spawn_ticker("restart-scheduler", period, move || self.fire())
    }

    fn fire(&mut self) {
        let since_last = self.last_fired.map(|t| t.elapsed().as_secs());
        debug!(?since_last, "Scheduled backend recycle due");
        self.last_fired = Some(Instant::now());
        self.trigger.send(Command::Recycle {
            trigger: RecycleTrigger::Scheduled,
            reply: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_ticker_fires_until_cancelled() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let timer = spawn_ticker("test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.cancel();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {} times", fired);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_ticker_does_not_fire_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let timer = spawn_ticker("test", Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.name(), "test");
        timer.cancel();
    }

    #[tokio::test]
    async fn test_scheduler_enqueues_scheduled_recycle() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = RestartScheduler::new(Duration::from_millis(20), Trigger::new(tx.downgrade()));
        let timer = scheduler.spawn();

        let command = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        timer.cancel();

        match command {
            Command::Recycle { trigger, reply } => {
                assert_eq!(trigger, RecycleTrigger::Scheduled);
                assert!(reply.is_none());
            }
            _ => panic!("expected a recycle command"),
        }
    }
}
