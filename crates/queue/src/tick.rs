//! Periodic safety-net tick.
//!
//! Dispatch is driven by queue transitions; the tick only re-checks for free
//! slots (expired retry backoffs, missed triggers), reports overdue jobs and
//! purges finished jobs past retention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::queue::RenderQueue;

/// Handle to a running safety-net task. Dropping it stops the task.
#[derive(Debug)]
pub struct SafetyNetTick {
    shutdown: Arc<Notify>,
    stopped: AtomicBool,
    task: Option<JoinHandle<()>>,
}

impl RenderQueue {
    /// Spawn the safety-net tick on the current tokio runtime, firing every
    /// `tick_interval`. The task holds only a weak reference and exits once
    /// the queue is dropped.
    pub fn start_safety_net(self: &Arc<Self>) -> SafetyNetTick {
        let shutdown = Arc::new(Notify::new());
        let queue = Arc::downgrade(self);
        let period = self.config().tick_interval;
        let task = tokio::spawn(run(queue, period, shutdown.clone()));

        SafetyNetTick {
            shutdown,
            stopped: AtomicBool::new(false),
            task: Some(task),
        }
    }
}

async fn run(queue: Weak<RenderQueue>, period: std::time::Duration, shutdown: Arc<Notify>) {
    tracing::info!(interval_ms = period.as_millis() as u64, "safety-net tick started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("safety-net tick received shutdown signal");
                break;
            }
            _ = interval.tick() => {
                let Some(queue) = queue.upgrade() else {
                    tracing::debug!("queue dropped; safety-net tick exiting");
                    break;
                };
                let report = queue.run_safety_net();
                if report.purged > 0 {
                    tracing::debug!(purged = report.purged, "retention purged finished jobs");
                }
            }
        }
    }
}

impl SafetyNetTick {
    /// Signal the task to stop. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit if the task is mid-tick.
            self.shutdown.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the task and wait for it to exit.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "safety-net tick task ended abnormally");
            }
        }
    }
}

impl Drop for SafetyNetTick {
    fn drop(&mut self) {
        self.stop();
    }
}
