//! Job table and lifecycle transitions.
//!
//! A single map keyed by job id holds every record; the job's `status` field
//! is the only place its partition is stored. The pending [`PriorityOrder`]
//! is an index over that map and is kept in step by the transition methods
//! below, which are the only code that changes a job's status.
//!
//! ```text
//! (none) ──admit──► pending ──start──► processing ──complete──► completed
//!                    │  ▲                  │
//!                 cancel └──── retry ──────┤
//!                    ▼                     └──give up──► failed
//!                cancelled
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use renderq_core::{JobId, ProjectId};

use crate::error::{QueueError, QueueResult};
use crate::order::PriorityOrder;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::StatusCounts;
use crate::types::{FailureInfo, Job, JobStatus, NewJob};

/// What a failure did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in pending with this retry count.
    Retried { retry_count: u32 },
    /// Terminal.
    Failed,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    /// Admission sequence, the final tiebreak in the priority order.
    seq: u64,
}

/// In-memory job table with a maintained pending index and per-status counts.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Entry>,
    pending: PriorityOrder,
    counts: StatusCounts,
    next_seq: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending job. Re-admitting the id of a cancelled job
    /// replaces the cancelled record; any other existing id is a duplicate.
    pub fn admit(&mut self, new_job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        self.check_admissible(&new_job.id)?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let job = new_job.into_job(now);
        self.pending
            .insert(job.id.clone(), job.priority, job.metadata.created_at, seq);
        let replaced = self.jobs.insert(job.id.clone(), Entry { job: job.clone(), seq });
        if let Some(old) = replaced {
            self.counts.forget(old.job.status);
        }
        self.counts.record(JobStatus::Pending);
        Ok(job)
    }

    /// `DuplicateJob` unless `id` is unknown or belongs to a cancelled record.
    pub fn check_admissible(&self, id: &JobId) -> QueueResult<()> {
        match self.jobs.get(id) {
            Some(existing) if existing.job.status != JobStatus::Cancelled => {
                Err(QueueError::DuplicateJob(id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// pending → processing.
    pub fn start(&mut self, id: &JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        let entry = self.entry_in(id, JobStatus::Pending)?;
        entry.job.status = JobStatus::Processing;
        entry.job.metadata.started_at = Some(now);
        entry.job.metadata.not_before = None;
        let job = entry.job.clone();
        self.pending.remove(id);
        self.counts.shift(JobStatus::Pending, JobStatus::Processing);
        Ok(job)
    }

    /// processing → completed.
    pub fn complete(
        &mut self,
        id: &JobId,
        result: Option<String>,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let entry = self.entry_in(id, JobStatus::Processing)?;
        entry.job.status = JobStatus::Completed;
        entry.job.metadata.completed_at = Some(now);
        entry.job.metadata.result = result;
        entry.job.metadata.progress = 100;
        let job = entry.job.clone();
        self.counts.shift(JobStatus::Processing, JobStatus::Completed);
        Ok(job)
    }

    /// processing → pending (retry) or failed, as `policy` decides.
    pub fn fail(
        &mut self,
        id: &JobId,
        failure: &FailureInfo,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<(Job, FailureOutcome)> {
        let entry = self.entry_in(id, JobStatus::Processing)?;
        let meta = &mut entry.job.metadata;
        meta.error = Some(failure.message.clone());
        meta.error_details = Some(failure.details_or_message());
        meta.failed_at = Some(now);

        match policy.decide(meta.retry_count, now) {
            RetryDecision::Retry {
                retry_count,
                not_before,
            } => {
                meta.retry_count = retry_count;
                meta.started_at = None;
                meta.progress = 0;
                meta.not_before = not_before;
                entry.job.status = JobStatus::Pending;

                let (priority, created_at, seq) =
                    (entry.job.priority, entry.job.metadata.created_at, entry.seq);
                let job = entry.job.clone();
                self.pending.insert(id.clone(), priority, created_at, seq);
                self.counts.shift(JobStatus::Processing, JobStatus::Pending);
                Ok((job, FailureOutcome::Retried { retry_count }))
            }
            RetryDecision::GiveUp => {
                entry.job.status = JobStatus::Failed;
                let job = entry.job.clone();
                self.counts.shift(JobStatus::Processing, JobStatus::Failed);
                Ok((job, FailureOutcome::Failed))
            }
        }
    }

    /// pending → cancelled. The record is kept for inspection until purged.
    pub fn cancel(&mut self, id: &JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        let entry = self.entry_in(id, JobStatus::Pending)?;
        entry.job.status = JobStatus::Cancelled;
        entry.job.metadata.cancelled_at = Some(now);
        entry.job.metadata.not_before = None;
        let job = entry.job.clone();
        self.pending.remove(id);
        self.counts.shift(JobStatus::Pending, JobStatus::Cancelled);
        Ok(job)
    }

    /// Change the priority of a pending job. Returns the job and its previous priority.
    pub fn set_priority(&mut self, id: &JobId, priority: i64) -> QueueResult<(Job, i64)> {
        let entry = self.entry_in(id, JobStatus::Pending)?;
        let previous = entry.job.priority;
        entry.job.priority = priority;
        let job = entry.job.clone();
        self.pending.reprioritize(id, priority);
        Ok((job, previous))
    }

    /// Record worker-reported progress on a processing job, clamped to 100.
    pub fn set_progress(&mut self, id: &JobId, percent: u8) -> QueueResult<Job> {
        let entry = self.entry_in(id, JobStatus::Processing)?;
        entry.job.metadata.progress = percent.min(100);
        Ok(entry.job.clone())
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id).map(|e| &e.job)
    }

    /// Highest-ranked pending job whose retry backoff has elapsed.
    pub fn next_eligible(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.pending
            .first_where(|id| self.get(id).is_some_and(|job| job.is_eligible(now)))
            .cloned()
    }

    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.pending.position(id)
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Per-status counts, maintained by the transitions.
    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    /// Number of records held, cancelled ones included.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs of a project, by source row (admission order for ties, rowless last).
    pub fn project_jobs(&self, project_id: &ProjectId) -> Vec<Job> {
        let mut entries: Vec<&Entry> = self
            .jobs
            .values()
            .filter(|e| e.job.belongs_to(project_id))
            .collect();
        entries.sort_by_key(|e| {
            (
                e.job.metadata.row_index.is_none(),
                e.job.metadata.row_index,
                e.seq,
            )
        });
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    pub fn project_counts(&self, project_id: &ProjectId) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.jobs.values().filter(|e| e.job.belongs_to(project_id)) {
            counts.record(entry.job.status);
        }
        counts
    }

    /// Processing jobs that started at or before `cutoff`.
    pub fn started_before(&self, cutoff: DateTime<Utc>) -> Vec<Job> {
        let mut overdue: Vec<&Entry> = self
            .jobs
            .values()
            .filter(|e| {
                e.job.status == JobStatus::Processing
                    && e.job.metadata.started_at.is_some_and(|at| at <= cutoff)
            })
            .collect();
        overdue.sort_by_key(|e| e.seq);
        overdue.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Delete completed jobs finished before `cutoff` and cancelled jobs
    /// withdrawn before it. Pending, processing and failed records stay.
    pub fn purge_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let counts = &mut self.counts;
        let before = self.jobs.len();
        self.jobs.retain(|_, e| {
            let finished_at = match e.job.status {
                JobStatus::Completed => e.job.metadata.completed_at,
                JobStatus::Cancelled => e.job.metadata.cancelled_at,
                _ => None,
            };
            let expired = finished_at.is_some_and(|at| at < cutoff);
            if expired {
                counts.forget(e.job.status);
            }
            !expired
        });
        before - self.jobs.len()
    }

    /// Delete every record of a project that is not currently processing.
    pub fn remove_project(&mut self, project_id: &ProjectId) -> Vec<Job> {
        let ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|e| e.job.belongs_to(project_id) && e.job.status != JobStatus::Processing)
            .map(|e| e.job.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            self.pending.remove(&id);
            if let Some(entry) = self.jobs.remove(&id) {
                self.counts.forget(entry.job.status);
                removed.push(entry.job);
            }
        }
        removed
    }

    fn entry_in(&mut self, id: &JobId, expected: JobStatus) -> QueueResult<&mut Entry> {
        let entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if entry.job.status != expected {
            return Err(QueueError::invalid_state(id, expected, entry.job.status));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn project(s: &str) -> ProjectId {
        ProjectId::new(s).unwrap()
    }

    fn recount(table: &JobTable) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in table.jobs.values() {
            counts.record(entry.job.status);
        }
        counts
    }

    fn admit(table: &mut JobTable, job: &str, priority: i64) -> Job {
        let new_job = NewJob::new(id(job), serde_json::json!({})).with_priority(priority);
        table.admit(new_job, Utc::now()).unwrap()
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);

        let err = table
            .admit(NewJob::new(id("a"), serde_json::json!({})), Utc::now())
            .unwrap_err();
        assert_eq!(err, QueueError::DuplicateJob(id("a")));
    }

    #[test]
    fn cancelled_id_can_be_readmitted() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);
        table.cancel(&id("a"), Utc::now()).unwrap();

        let again = admit(&mut table, "a", 2);
        assert_eq!(again.status, JobStatus::Pending);
        assert_eq!(table.position(&id("a")), Some(1));
    }

    #[test]
    fn start_requires_pending() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);
        table.start(&id("a"), Utc::now()).unwrap();

        let err = table.start(&id("a"), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidState {
                expected: JobStatus::Pending,
                actual: JobStatus::Processing,
                ..
            }
        ));
        assert_eq!(
            table.start(&id("nope"), Utc::now()).unwrap_err(),
            QueueError::NotFound(id("nope"))
        );
    }

    #[test]
    fn complete_stamps_result() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);
        table.start(&id("a"), Utc::now()).unwrap();

        let done = table
            .complete(&id("a"), Some("/renders/a.mp4".into()), Utc::now())
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.metadata.result.as_deref(), Some("/renders/a.mp4"));
        assert!(done.metadata.completed_at.is_some());
        assert_eq!(done.metadata.progress, 100);
    }

    #[test]
    fn retry_keeps_arrival_position() {
        let mut table = JobTable::new();
        admit(&mut table, "first", 0);
        admit(&mut table, "second", 0);
        table.start(&id("first"), Utc::now()).unwrap();

        let (job, outcome) = table
            .fail(&id("first"), &"boom".into(), &RetryPolicy::immediate(2), Utc::now())
            .unwrap();

        assert_eq!(outcome, FailureOutcome::Retried { retry_count: 1 });
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.metadata.error.as_deref(), Some("boom"));
        assert_eq!(job.metadata.error_details.as_deref(), Some("boom"));
        assert!(job.metadata.started_at.is_none());
        assert_eq!(table.pending_ids(), vec![id("first"), id("second")]);
    }

    #[test]
    fn exhausted_retries_fail_permanently() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);
        let policy = RetryPolicy::immediate(1);

        table.start(&id("a"), Utc::now()).unwrap();
        table.fail(&id("a"), &"one".into(), &policy, Utc::now()).unwrap();
        table.start(&id("a"), Utc::now()).unwrap();
        let (job, outcome) = table.fail(&id("a"), &"two".into(), &policy, Utc::now()).unwrap();

        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.metadata.retry_count, 1);
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn backoff_hides_job_until_due() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);
        let now = Utc::now();
        let policy = RetryPolicy::immediate(1).with_backoff(
            crate::retry::BackoffStrategy::Fixed,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(30),
        );

        table.start(&id("a"), now).unwrap();
        table.fail(&id("a"), &"flaky".into(), &policy, now).unwrap();

        assert_eq!(table.next_eligible(now), None);
        assert_eq!(table.position(&id("a")), Some(1));
        assert_eq!(table.next_eligible(now + Duration::seconds(30)), Some(id("a")));
    }

    #[test]
    fn cancel_only_from_pending() {
        let mut table = JobTable::new();
        admit(&mut table, "a", 0);
        admit(&mut table, "b", 0);
        table.start(&id("b"), Utc::now()).unwrap();

        let cancelled = table.cancel(&id("a"), Utc::now()).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(table.position(&id("a")), None);
        assert_eq!(table.get(&id("a")).map(|j| j.status), Some(JobStatus::Cancelled));

        assert!(matches!(
            table.cancel(&id("b"), Utc::now()),
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[test]
    fn project_jobs_sorted_by_row() {
        let mut table = JobTable::new();
        let p = project("campaign");
        for (job, row) in [("r3", Some(3)), ("none", None), ("r1", Some(1)), ("r2", Some(2))] {
            let mut new_job = NewJob::new(id(job), serde_json::json!({})).for_project(p.clone());
            new_job.row_index = row;
            table.admit(new_job, Utc::now()).unwrap();
        }
        admit(&mut table, "other", 0);

        let ids: Vec<_> = table
            .project_jobs(&p)
            .into_iter()
            .map(|j| j.id.to_string())
            .collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "none"]);
        assert_eq!(table.project_counts(&p).pending, 4);
    }

    #[test]
    fn purge_only_touches_old_completed_and_cancelled() {
        let mut table = JobTable::new();
        let t0 = Utc::now();
        for job in ["done", "failed", "running"] {
            admit(&mut table, job, 0);
            table.start(&id(job), t0).unwrap();
        }
        admit(&mut table, "waiting", 0);
        admit(&mut table, "withdrawn", 0);
        table.complete(&id("done"), None, t0).unwrap();
        table
            .fail(&id("failed"), &"x".into(), &RetryPolicy::no_retry(), t0)
            .unwrap();
        table.cancel(&id("withdrawn"), t0).unwrap();

        // Strictly older than the cutoff.
        assert_eq!(table.purge_before(t0), 0);
        assert_eq!(table.purge_before(t0 + Duration::milliseconds(1)), 2);
        assert!(table.get(&id("done")).is_none());
        assert!(table.get(&id("withdrawn")).is_none());
        assert_eq!(table.counts().live(), 3);
        assert_eq!(table.counts().cancelled, 0);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn counts_follow_every_transition() {
        let mut table = JobTable::new();
        let now = Utc::now();
        let p = project("campaign");
        for job in ["a", "b", "c", "d"] {
            let new_job = NewJob::new(id(job), serde_json::json!({})).for_project(p.clone());
            table.admit(new_job, now).unwrap();
        }
        table.start(&id("a"), now).unwrap();
        table.complete(&id("a"), None, now).unwrap();
        table.start(&id("b"), now).unwrap();
        table
            .fail(&id("b"), &"x".into(), &RetryPolicy::immediate(1), now)
            .unwrap();
        table.cancel(&id("c"), now).unwrap();
        admit(&mut table, "c", 0);

        let counts = table.counts();
        assert_eq!(counts, recount(&table));
        assert_eq!(
            (counts.pending, counts.processing, counts.completed, counts.cancelled),
            (3, 0, 1, 0)
        );

        table.remove_project(&p);
        assert_eq!(table.counts(), recount(&table));
        assert_eq!(table.counts().live(), 1);
    }

    #[test]
    fn remove_project_spares_processing() {
        let mut table = JobTable::new();
        let p = project("campaign");
        for job in ["a", "b", "c"] {
            let new_job = NewJob::new(id(job), serde_json::json!({})).for_project(p.clone());
            table.admit(new_job, Utc::now()).unwrap();
        }
        table.start(&id("a"), Utc::now()).unwrap();

        let removed = table.remove_project(&p);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.pending_len(), 0);
        assert_eq!(table.get(&id("a")).map(|j| j.status), Some(JobStatus::Processing));
    }
}
