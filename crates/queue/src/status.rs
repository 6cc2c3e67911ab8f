//! Read-only aggregates for dashboards and status endpoints.
//!
//! These are computed from the job table on request. Scheduling never looks
//! at them; the dispatcher keeps its own active-worker counter.

use serde::{Deserialize, Serialize};

use renderq_core::ProjectId;

use crate::types::JobStatus;

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn slot(&mut self, status: JobStatus) -> &mut usize {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub(crate) fn record(&mut self, status: JobStatus) {
        *self.slot(status) += 1;
    }

    pub(crate) fn forget(&mut self, status: JobStatus) {
        let slot = self.slot(status);
        *slot = slot.saturating_sub(1);
    }

    pub(crate) fn shift(&mut self, from: JobStatus, to: JobStatus) {
        self.forget(from);
        self.record(to);
    }

    /// Jobs that count toward the queue size cap (everything but cancelled).
    pub fn live(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Snapshot of the whole queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Cancelled jobs still retained for inspection.
    pub cancelled: usize,
    /// pending + processing + completed + failed
    pub total: usize,
    pub active_workers: usize,
    pub max_concurrent_renders: usize,
    /// Length of the pending priority order.
    pub queue_length: usize,
}

impl QueueStatus {
    pub(crate) fn new(
        counts: StatusCounts,
        active_workers: usize,
        max_concurrent_renders: usize,
        queue_length: usize,
    ) -> Self {
        Self {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            total: counts.live(),
            active_workers,
            max_concurrent_renders,
            queue_length,
        }
    }

    /// Nothing left waiting or running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Progress of one project's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: ProjectId,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ProjectSummary {
    pub(crate) fn new(project_id: ProjectId, counts: StatusCounts) -> Self {
        Self {
            project_id,
            total: counts.live() + counts.cancelled,
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
        }
    }

    /// Every row reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
