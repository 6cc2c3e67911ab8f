//! Drives a [`RenderWorker`] from the queue's `ProcessJob` handoffs.
//!
//! The queue's event bus is a blocking channel, so a blocking task forwards
//! handoffs into a tokio channel; an async loop then runs one render task per
//! job and reports each outcome back to the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};

use renderq_queue::{FailureInfo, Job, JobEvent, JobEventKind, RenderQueue};

use crate::worker::{ProgressReporter, RenderWorker};

/// How often the bridge wakes to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Entry point for running a worker against a queue.
pub struct RenderDispatcher;

impl RenderDispatcher {
    /// Start consuming handoffs. Must be called inside a tokio runtime.
    ///
    /// The subscription is registered before this returns, so jobs admitted
    /// afterwards are never missed. Jobs already processing when the
    /// dispatcher starts belong to whoever received their handoff.
    pub fn spawn<W: RenderWorker>(queue: Arc<RenderQueue>, worker: Arc<W>) -> DispatcherHandle {
        let subscription = queue.subscribe_to(&[JobEventKind::ProcessJob]);
        let stop = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());
        let (tx, rx) = unbounded_channel::<Job>();

        let bridge_stop = Arc::clone(&stop);
        let bridge = tokio::task::spawn_blocking(move || {
            let mut unrendered = Vec::new();
            loop {
                if bridge_stop.load(Ordering::SeqCst) {
                    break;
                }
                match subscription.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => {
                        // Sends fail once the driver has closed; keep the job.
                        if let Err(SendError(job)) = tx.send(event.into_job()) {
                            unrendered.push(job);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Dropping the subscription here unregisters this dispatcher.
            unrendered.extend(subscription.drain().into_iter().map(JobEvent::into_job));
            tracing::debug!("handoff bridge stopped");
            unrendered
        });

        let driver = tokio::spawn(drive(queue, worker, rx, Arc::clone(&shutdown)));
        tracing::info!("render dispatcher started");

        DispatcherHandle {
            stop,
            shutdown,
            bridge,
            driver,
        }
    }
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    bridge: JoinHandle<Vec<Job>>,
    driver: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop taking handoffs and wait for in-flight renders to report back.
    ///
    /// Returns the jobs whose handoff arrived but was never rendered. They are
    /// still processing in the queue; the caller owes each a `complete` or
    /// `fail`. Once this returns the dispatcher no longer receives handoffs.
    pub async fn shutdown(self) -> Vec<Job> {
        self.shutdown.notify_one();
        if let Err(err) = self.driver.await {
            tracing::warn!(error = %err, "dispatcher loop ended abnormally");
        }

        // Renders that finished above may have handed off more jobs, so the
        // bridge keeps listening until the driver is done.
        self.stop.store(true, Ordering::SeqCst);
        let unrendered = match self.bridge.await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(error = %err, "handoff bridge ended abnormally");
                Vec::new()
            }
        };
        for job in &unrendered {
            tracing::warn!(job_id = %job.id, "handoff not rendered before shutdown");
        }
        tracing::info!(unrendered = unrendered.len(), "render dispatcher stopped");
        unrendered
    }
}

async fn drive<W: RenderWorker>(
    queue: Arc<RenderQueue>,
    worker: Arc<W>,
    mut handoffs: UnboundedReceiver<Job>,
    shutdown: Arc<Notify>,
) {
    let mut renders = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            next = handoffs.recv() => match next {
                Some(job) => {
                    renders.spawn(execute(Arc::clone(&queue), Arc::clone(&worker), job));
                }
                None => break,
            },
            Some(joined) = renders.join_next(), if !renders.is_empty() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "render task ended abnormally");
                }
            }
        }
    }

    handoffs.close();
    while let Ok(job) = handoffs.try_recv() {
        renders.spawn(execute(Arc::clone(&queue), Arc::clone(&worker), job));
    }
    while let Some(joined) = renders.join_next().await {
        if let Err(err) = joined {
            tracing::warn!(error = %err, "render task ended abnormally");
        }
    }
}

/// Run one attempt and report its outcome. A panicking worker counts as a
/// failed attempt so the job always leaves processing.
async fn execute<W: RenderWorker>(queue: Arc<RenderQueue>, worker: Arc<W>, job: Job) {
    let id = job.id.clone();
    let progress = ProgressReporter::new(Arc::clone(&queue), id.clone());
    tracing::debug!(job_id = %id, retry_count = job.retry_count(), "render starting");

    let attempt = tokio::spawn(async move { worker.render(&job, progress).await });
    let reported = match attempt.await {
        Ok(Ok(result)) => queue.complete(&id, result),
        Ok(Err(failure)) => queue.fail(&id, failure),
        Err(err) => queue.fail(
            &id,
            FailureInfo::new("render task panicked").with_details(err.to_string()),
        ),
    };

    if let Err(err) = reported {
        tracing::warn!(job_id = %id, error = %err, "could not report render outcome");
    }
}
