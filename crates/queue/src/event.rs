//! Lifecycle events published by the queue.
//!
//! Every event carries a snapshot of the job taken at the moment of the
//! transition. `ProcessJob` is the handoff to the render worker; the rest are
//! informational.

use serde::{Deserialize, Serialize};

use renderq_core::JobId;

use crate::types::Job;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    JobAdded { job: Job, position: Option<usize> },
    JobStarted { job: Job, active_workers: usize },
    /// Request for a render worker to execute `job`.
    ProcessJob { job: Job },
    JobCompleted { job: Job },
    JobFailed { job: Job },
    JobRetry { job: Job, retry_count: u32 },
    JobCancelled { job: Job },
    JobPriorityUpdated { job: Job, previous_priority: i64 },
    JobProgress { job: Job, progress: u8 },
}

/// Discriminant of a [`JobEvent`], for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventKind {
    JobAdded,
    JobStarted,
    ProcessJob,
    JobCompleted,
    JobFailed,
    JobRetry,
    JobCancelled,
    JobPriorityUpdated,
    JobProgress,
}

impl JobEvent {
    pub fn kind(&self) -> JobEventKind {
        match self {
            JobEvent::JobAdded { .. } => JobEventKind::JobAdded,
            JobEvent::JobStarted { .. } => JobEventKind::JobStarted,
            JobEvent::ProcessJob { .. } => JobEventKind::ProcessJob,
            JobEvent::JobCompleted { .. } => JobEventKind::JobCompleted,
            JobEvent::JobFailed { .. } => JobEventKind::JobFailed,
            JobEvent::JobRetry { .. } => JobEventKind::JobRetry,
            JobEvent::JobCancelled { .. } => JobEventKind::JobCancelled,
            JobEvent::JobPriorityUpdated { .. } => JobEventKind::JobPriorityUpdated,
            JobEvent::JobProgress { .. } => JobEventKind::JobProgress,
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            JobEvent::JobAdded { job, .. }
            | JobEvent::JobStarted { job, .. }
            | JobEvent::ProcessJob { job }
            | JobEvent::JobCompleted { job }
            | JobEvent::JobFailed { job }
            | JobEvent::JobRetry { job, .. }
            | JobEvent::JobCancelled { job }
            | JobEvent::JobPriorityUpdated { job, .. }
            | JobEvent::JobProgress { job, .. } => job,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job().id
    }

    pub fn into_job(self) -> Job {
        match self {
            JobEvent::JobAdded { job, .. }
            | JobEvent::JobStarted { job, .. }
            | JobEvent::ProcessJob { job }
            | JobEvent::JobCompleted { job }
            | JobEvent::JobFailed { job }
            | JobEvent::JobRetry { job, .. }
            | JobEvent::JobCancelled { job }
            | JobEvent::JobPriorityUpdated { job, .. }
            | JobEvent::JobProgress { job, .. } => job,
        }
    }
}
