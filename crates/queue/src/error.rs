//! Errors returned by queue operations.

use renderq_core::{CoreError, JobId};

use crate::types::JobStatus;

pub type QueueResult<T> = Result<T, QueueError>;

/// Synchronous, recoverable failures of a queue operation.
///
/// None of these leave the queue in a changed state: an operation either
/// succeeds completely or returns one of these without side effects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Admission refused; the caller should back off or drop the job.
    #[error("queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    InvalidState {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),
    #[error(transparent)]
    InvalidId(#[from] CoreError),
    /// Direct dispatch attempted while every render slot is busy.
    #[error("no free render slot ({limit} in use)")]
    NoFreeSlot { limit: usize },
}

impl QueueError {
    pub(crate) fn invalid_state(id: &JobId, expected: JobStatus, actual: JobStatus) -> Self {
        Self::InvalidState {
            id: id.clone(),
            expected,
            actual,
        }
    }
}
