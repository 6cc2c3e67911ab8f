//! The render queue: admission, concurrency-gated dispatch, completion,
//! failure/retry, cancellation and lifecycle events.
//!
//! ## Serialization
//!
//! All state lives in one [`QueueState`] behind a single mutex. Every public
//! operation takes the lock exactly once, applies its transition, publishes
//! the resulting events and, where it frees or adds work, runs the dispatcher
//! before releasing the lock. "Is there a free slot?" and "dispatch the next
//! job" therefore happen atomically no matter which thread (HTTP handler,
//! worker callback, timer) called in.
//!
//! Events are published under the lock so subscribers see them in transition
//! order. Publishing is a non-blocking channel send per subscriber and the bus
//! never calls back into the queue.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use renderq_core::{JobId, ProjectId};
use renderq_events::{EventBus, InMemoryEventBus, Subscription};

use crate::config::{ConfigError, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::event::{JobEvent, JobEventKind};
use crate::retry::RetryPolicy;
use crate::status::{ProjectSummary, QueueStatus};
use crate::store::{FailureOutcome, JobTable};
use crate::types::{FailureInfo, Job, JobStatus, NewJob};

#[derive(Debug, Default)]
struct QueueState {
    table: JobTable,
    /// Jobs handed to workers and not yet reported back. This, not the
    /// status aggregate, is what the concurrency gate checks.
    active_workers: usize,
}

/// What one safety-net pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub dispatched: Vec<JobId>,
    pub overdue: Vec<JobId>,
    pub purged: usize,
}

/// Priority render queue with a bounded number of concurrent renders.
///
/// Construct one per render backend and share it as `Arc<RenderQueue>`.
#[derive(Debug)]
pub struct RenderQueue {
    config: QueueConfig,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    events: InMemoryEventBus<JobEvent>,
}

impl RenderQueue {
    /// Build a queue from validated settings. A zero concurrency limit, queue
    /// size or tick interval is refused here rather than leaving jobs pending
    /// forever.
    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: QueueConfig) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            retry,
            state: Mutex::new(QueueState::default()),
            events: InMemoryEventBus::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to every lifecycle event.
    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the given event kinds only. Render workers use
    /// `&[JobEventKind::ProcessJob]`.
    pub fn subscribe_to(&self, kinds: &[JobEventKind]) -> Subscription<JobEvent> {
        let kinds = kinds.to_vec();
        self.events
            .subscribe_filtered(Box::new(move |event: &JobEvent| kinds.contains(&event.kind())))
    }

    /// Admit a job as pending. `JobAdded` is published before this returns,
    /// after which the dispatcher runs; the returned snapshot is the pending
    /// record as admitted.
    pub fn admit(&self, new_job: NewJob) -> QueueResult<Job> {
        let now = Utc::now();
        let mut state = self.lock();

        state.table.check_admissible(&new_job.id)?;
        let capacity = self.config.max_queue_size;
        if state.table.counts().live() >= capacity {
            warn!(job_id = %new_job.id, capacity, "queue full; admission refused");
            return Err(QueueError::QueueFull { capacity });
        }

        let job = state.table.admit(new_job, now)?;
        let position = state.table.position(&job.id);
        info!(
            job_id = %job.id,
            priority = job.priority,
            position = ?position,
            "job added to queue"
        );
        self.emit(JobEvent::JobAdded {
            job: job.clone(),
            position,
        });

        self.process_next_locked(&mut state, now);
        Ok(job)
    }

    /// Dispatch a specific pending job, bypassing the priority order but not
    /// the concurrency gate. Publishes `JobStarted` and the `ProcessJob` handoff.
    pub fn dispatch(&self, id: &JobId) -> QueueResult<Job> {
        let now = Utc::now();
        let mut state = self.lock();

        let status = state
            .table
            .get(id)
            .map(|job| job.status)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if status != JobStatus::Pending {
            return Err(QueueError::invalid_state(id, JobStatus::Pending, status));
        }
        if state.active_workers >= self.config.max_concurrent_renders {
            return Err(QueueError::NoFreeSlot {
                limit: self.config.max_concurrent_renders,
            });
        }

        let job = self.start_locked(&mut state, id, now)?;
        self.emit(JobEvent::ProcessJob { job: job.clone() });
        Ok(job)
    }

    /// Record a successful render and refill the freed slot.
    pub fn complete(&self, id: &JobId, result: Option<String>) -> QueueResult<Job> {
        let now = Utc::now();
        let mut state = self.lock();

        let job = state.table.complete(id, result, now)?;
        state.active_workers = state.active_workers.saturating_sub(1);
        info!(
            job_id = %id,
            result = ?job.metadata.result,
            active_workers = state.active_workers,
            "job completed"
        );
        self.emit(JobEvent::JobCompleted { job: job.clone() });

        self.process_next_locked(&mut state, now);
        Ok(job)
    }

    /// Record a failed render. The retry policy sends the job back to
    /// pending (`JobRetry`) or fails it for good (`JobFailed`).
    pub fn fail(&self, id: &JobId, failure: impl Into<FailureInfo>) -> QueueResult<Job> {
        let failure = failure.into();
        let now = Utc::now();
        let mut state = self.lock();

        let (job, outcome) = state.table.fail(id, &failure, &self.retry, now)?;
        state.active_workers = state.active_workers.saturating_sub(1);

        match outcome {
            FailureOutcome::Retried { retry_count } => {
                warn!(
                    job_id = %id,
                    error = %failure.message,
                    retry_count,
                    max_retries = self.retry.max_retries,
                    not_before = ?job.metadata.not_before,
                    "job failed; retrying"
                );
                self.emit(JobEvent::JobRetry {
                    job: job.clone(),
                    retry_count,
                });
            }
            FailureOutcome::Failed => {
                warn!(
                    job_id = %id,
                    error = %failure.message,
                    retry_count = job.metadata.retry_count,
                    "job failed permanently"
                );
                self.emit(JobEvent::JobFailed { job: job.clone() });
            }
        }

        self.process_next_locked(&mut state, now);
        Ok(job)
    }

    /// Withdraw a pending job. In-flight and finished jobs cannot be cancelled.
    pub fn cancel(&self, id: &JobId) -> QueueResult<Job> {
        let now = Utc::now();
        let mut state = self.lock();

        let job = state.table.cancel(id, now)?;
        info!(job_id = %id, "job cancelled");
        self.emit(JobEvent::JobCancelled { job: job.clone() });

        self.process_next_locked(&mut state, now);
        Ok(job)
    }

    /// Change the priority of a pending job and re-rank it.
    pub fn update_priority(&self, id: &JobId, priority: i64) -> QueueResult<Job> {
        let mut state = self.lock();

        let (job, previous_priority) = state.table.set_priority(id, priority)?;
        debug!(
            job_id = %id,
            previous_priority,
            priority,
            position = ?state.table.position(id),
            "job priority updated"
        );
        self.emit(JobEvent::JobPriorityUpdated {
            job: job.clone(),
            previous_priority,
        });
        Ok(job)
    }

    /// Store render progress (percent, clamped to 100) reported by the worker.
    pub fn report_progress(&self, id: &JobId, percent: u8) -> QueueResult<Job> {
        let mut state = self.lock();

        let job = state.table.set_progress(id, percent)?;
        let progress = job.metadata.progress;
        self.emit(JobEvent::JobProgress {
            job: job.clone(),
            progress,
        });
        Ok(job)
    }

    /// Dispatch the highest-ranked eligible pending job if a slot is free.
    pub fn process_next(&self) -> Option<Job> {
        let now = Utc::now();
        let mut state = self.lock();
        self.process_next_locked(&mut state, now)
    }

    /// Dispatch until every slot is busy or nothing eligible is pending.
    pub fn fill_slots(&self) -> Vec<Job> {
        let now = Utc::now();
        let mut state = self.lock();
        let mut dispatched = Vec::new();
        while let Some(job) = self.process_next_locked(&mut state, now) {
            dispatched.push(job);
        }
        dispatched
    }

    /// Look a job up in any state, including retained cancellations.
    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.lock().table.get(id).cloned()
    }

    /// 1-based rank of a pending job.
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.lock().table.position(id)
    }

    /// Pending job ids in dispatch order.
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.lock().table.pending_ids()
    }

    pub fn active_workers(&self) -> usize {
        self.lock().active_workers
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus::new(
            state.table.counts(),
            state.active_workers,
            self.config.max_concurrent_renders,
            state.table.pending_len(),
        )
    }

    /// Every job of a project, ordered by source row.
    pub fn project_jobs(&self, project_id: &ProjectId) -> Vec<Job> {
        self.lock().table.project_jobs(project_id)
    }

    pub fn project_summary(&self, project_id: &ProjectId) -> ProjectSummary {
        let counts = self.lock().table.project_counts(project_id);
        ProjectSummary::new(project_id.clone(), counts)
    }

    /// Drop a project's jobs. Pending jobs are cancelled first (publishing
    /// `JobCancelled`); processing jobs are left for their worker to report.
    /// Returns how many records were removed.
    pub fn clear_project(&self, project_id: &ProjectId) -> usize {
        let now = Utc::now();
        let mut state = self.lock();

        let pending: Vec<JobId> = state
            .table
            .project_jobs(project_id)
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| job.id)
            .collect();
        for id in &pending {
            if let Ok(job) = state.table.cancel(id, now) {
                self.emit(JobEvent::JobCancelled { job });
            }
        }

        let removed = state.table.remove_project(project_id).len();
        info!(project_id = %project_id, removed, "project jobs cleared");
        removed
    }

    /// Purge completed and cancelled jobs that finished more than `max_age` ago.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        match chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        {
            Some(cutoff) => self.cleanup_before(cutoff),
            None => 0,
        }
    }

    /// Purge completed jobs that finished before `cutoff` and cancelled jobs
    /// withdrawn before it.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let purged = self.lock().table.purge_before(cutoff);
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "cleaned up finished jobs");
        }
        purged
    }

    /// Processing jobs running longer than the configured job timeout.
    pub fn overdue_jobs(&self) -> Vec<Job> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(self.config.job_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Vec::new();
        };
        self.lock().table.started_before(cutoff)
    }

    /// One safety-net pass: refill slots, report overdue jobs, purge
    /// completed and cancelled jobs past the retention if one is configured.
    ///
    /// Event-triggered dispatch already covers every transition; this pass
    /// only matters if a trigger was missed or a retry backoff expired.
    pub fn run_safety_net(&self) -> TickReport {
        let dispatched: Vec<JobId> = self.fill_slots().into_iter().map(|job| job.id).collect();
        if !dispatched.is_empty() {
            debug!(count = dispatched.len(), "safety-net tick dispatched jobs");
        }

        let overdue: Vec<JobId> = self.overdue_jobs().into_iter().map(|job| job.id).collect();
        for id in &overdue {
            warn!(
                job_id = %id,
                timeout_secs = self.config.job_timeout.as_secs(),
                "job exceeded timeout; still occupying a render slot"
            );
        }

        let purged = self
            .config
            .completed_retention
            .map_or(0, |retention| self.cleanup(retention));

        TickReport {
            dispatched,
            overdue,
            purged,
        }
    }

    fn process_next_locked(&self, state: &mut QueueState, now: DateTime<Utc>) -> Option<Job> {
        if state.active_workers >= self.config.max_concurrent_renders {
            return None;
        }
        let id = state.table.next_eligible(now)?;
        let job = match self.start_locked(state, &id, now) {
            Ok(job) => job,
            Err(err) => {
                warn!(job_id = %id, error = %err, "failed to start next job");
                return None;
            }
        };
        self.emit(JobEvent::ProcessJob { job: job.clone() });
        Some(job)
    }

    fn start_locked(
        &self,
        state: &mut QueueState,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let job = state.table.start(id, now)?;
        state.active_workers += 1;
        debug!(
            job_id = %id,
            active_workers = state.active_workers,
            retry_count = job.metadata.retry_count,
            "job started processing"
        );
        self.emit(JobEvent::JobStarted {
            job: job.clone(),
            active_workers: state.active_workers,
        });
        Ok(job)
    }

    fn emit(&self, event: JobEvent) {
        let kind = event.kind();
        match self.events.publish(event) {
            Ok(0) if kind == JobEventKind::ProcessJob => {
                warn!("no render worker subscribed; handed-off job stays processing");
            }
            Ok(_) => {}
            Err(err) => warn!(?kind, error = ?err, "failed to publish job event"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every transition is applied in full before anything fallible runs,
        // so state behind a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RenderQueue {
    fn default() -> Self {
        Self::with_valid_config(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use renderq_core::JobId;

    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn new_job(s: &str, priority: i64) -> NewJob {
        NewJob::new(id(s), serde_json::json!({ "template": "intro.aep" })).with_priority(priority)
    }

    fn kinds(events: &[JobEvent]) -> Vec<JobEventKind> {
        events.iter().map(JobEvent::kind).collect()
    }

    #[test]
    fn construction_rejects_configs_that_cannot_schedule() {
        let zero_slots = QueueConfig::default().with_max_concurrent_renders(0);
        assert!(matches!(
            RenderQueue::new(zero_slots),
            Err(ConfigError::Validation(_))
        ));

        let zero_tick = QueueConfig::default().with_tick_interval(Duration::ZERO);
        assert!(matches!(
            RenderQueue::new(zero_tick),
            Err(ConfigError::Validation(_))
        ));

        let no_room = QueueConfig::default().with_max_queue_size(0);
        assert!(RenderQueue::new(no_room).is_err());

        assert!(RenderQueue::new(QueueConfig::default()).is_ok());
    }

    #[test]
    fn admission_dispatches_into_free_slot() {
        let queue = RenderQueue::default();
        let events = queue.subscribe();

        let admitted = queue.admit(new_job("a", 0)).unwrap();
        assert_eq!(admitted.status, JobStatus::Pending);

        assert_eq!(
            kinds(&events.drain()),
            vec![
                JobEventKind::JobAdded,
                JobEventKind::JobStarted,
                JobEventKind::ProcessJob
            ]
        );
        assert_eq!(queue.job(&id("a")).unwrap().status, JobStatus::Processing);
        assert_eq!(queue.active_workers(), 1);
    }

    #[test]
    fn higher_priority_overtakes_while_slot_busy() {
        let queue = RenderQueue::default();
        queue.admit(new_job("blocker", 0)).unwrap();
        queue.admit(new_job("a", 0)).unwrap();
        queue.admit(new_job("b", 5)).unwrap();

        assert_eq!(queue.pending_ids(), vec![id("b"), id("a")]);
        assert_eq!(queue.position(&id("a")), Some(2));

        let done = queue.complete(&id("blocker"), None).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(queue.job(&id("b")).unwrap().status, JobStatus::Processing);
        assert_eq!(queue.job(&id("a")).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn dispatch_respects_gate() {
        let queue = RenderQueue::default();
        queue.admit(new_job("a", 0)).unwrap();
        queue.admit(new_job("b", 0)).unwrap();

        assert_eq!(
            queue.dispatch(&id("b")).unwrap_err(),
            QueueError::NoFreeSlot { limit: 1 }
        );
        assert!(matches!(
            queue.dispatch(&id("a")),
            Err(QueueError::InvalidState { .. })
        ));
        assert_eq!(
            queue.dispatch(&id("ghost")).unwrap_err(),
            QueueError::NotFound(id("ghost"))
        );
    }

    #[test]
    fn direct_dispatch_ignores_backoff() {
        let config = QueueConfig::default().with_retry_backoff(
            crate::retry::BackoffStrategy::Fixed,
            Duration::from_secs(30),
            Duration::from_secs(30),
        );
        let queue = RenderQueue::new(config).unwrap();
        queue.admit(new_job("a", 0)).unwrap();
        queue.fail(&id("a"), "out of memory").unwrap();
        assert!(queue.process_next().is_none());

        let events = queue.subscribe_to(&[JobEventKind::ProcessJob]);
        let job = queue.dispatch(&id("a")).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.metadata.retry_count, 1);
        assert_eq!(events.drain().len(), 1);
    }

    #[test]
    fn complete_requires_processing() {
        let queue = RenderQueue::default();
        queue.admit(new_job("a", 0)).unwrap();
        queue.admit(new_job("b", 0)).unwrap();

        assert!(matches!(
            queue.complete(&id("b"), None),
            Err(QueueError::InvalidState {
                expected: JobStatus::Processing,
                actual: JobStatus::Pending,
                ..
            })
        ));
        assert_eq!(queue.active_workers(), 1);
    }

    #[test]
    fn progress_is_clamped_and_published() {
        let queue = RenderQueue::default();
        queue.admit(new_job("a", 0)).unwrap();
        let events = queue.subscribe_to(&[JobEventKind::JobProgress]);

        let job = queue.report_progress(&id("a"), 140).unwrap();
        assert_eq!(job.metadata.progress, 100);
        assert!(matches!(
            events.try_recv().unwrap(),
            JobEvent::JobProgress { progress: 100, .. }
        ));
    }

    #[test]
    fn priority_update_reorders_and_reports_previous() {
        let queue = RenderQueue::default();
        queue.admit(new_job("blocker", 0)).unwrap();
        queue.admit(new_job("a", 1)).unwrap();
        queue.admit(new_job("b", 0)).unwrap();
        let events = queue.subscribe();

        queue.update_priority(&id("b"), 7).unwrap();
        assert_eq!(queue.pending_ids(), vec![id("b"), id("a")]);
        assert!(matches!(
            events.try_recv().unwrap(),
            JobEvent::JobPriorityUpdated { previous_priority: 0, .. }
        ));
        assert!(matches!(
            queue.update_priority(&id("blocker"), 3),
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[test]
    fn overdue_jobs_respect_timeout() {
        let queue =
            RenderQueue::new(QueueConfig::default().with_job_timeout(Duration::ZERO)).unwrap();
        queue.admit(new_job("a", 0)).unwrap();

        let overdue = queue.overdue_jobs();
        assert_eq!(overdue.len(), 1);
        // Overdue reporting never changes state.
        assert_eq!(queue.job(&id("a")).unwrap().status, JobStatus::Processing);

        let relaxed = RenderQueue::default();
        relaxed.admit(new_job("b", 0)).unwrap();
        assert!(relaxed.overdue_jobs().is_empty());
    }

    #[test]
    fn safety_net_dispatches_after_backoff() {
        let config = QueueConfig::default().with_retry_backoff(
            crate::retry::BackoffStrategy::Fixed,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let queue = RenderQueue::new(config).unwrap();
        queue.admit(new_job("a", 0)).unwrap();

        let retried = queue.fail(&id("a"), "encoder crashed").unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(retried.metadata.not_before.is_some());
        assert_eq!(queue.active_workers(), 0);
        assert!(queue.process_next().is_none());

        std::thread::sleep(Duration::from_millis(30));
        let report = queue.run_safety_net();
        assert_eq!(report.dispatched, vec![id("a")]);
    }

    #[test]
    fn clear_project_cancels_pending_and_keeps_processing() {
        let queue = RenderQueue::default();
        let project = ProjectId::new("campaign").unwrap();
        for (n, name) in ["r1", "r2", "r3"].iter().enumerate() {
            let job = new_job(name, 0)
                .for_project(project.clone())
                .with_row(n as u64, serde_json::Value::Null);
            queue.admit(job).unwrap();
        }
        let cancelled = queue.subscribe_to(&[JobEventKind::JobCancelled]);

        assert_eq!(queue.clear_project(&project), 2);
        assert_eq!(cancelled.drain().len(), 2);

        let summary = queue.project_summary(&project);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.processing, 1);
        assert!(!summary.is_finished());
    }
}
