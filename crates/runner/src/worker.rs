//! The seam between the queue and whatever actually renders a job.

use std::sync::Arc;

use renderq_core::JobId;
use renderq_queue::{FailureInfo, Job, RenderQueue};

/// Outcome of one render attempt: an optional result reference (output
/// path, URL) on success, or the failure to hand to the retry policy.
pub type RenderResult = Result<Option<String>, FailureInfo>;

/// Executes one job handed off by the queue.
///
/// Implementations do not touch job state; the dispatcher reports the
/// returned outcome to the queue exactly once per attempt.
#[async_trait::async_trait]
pub trait RenderWorker: Send + Sync + 'static {
    async fn render(&self, job: &Job, progress: ProgressReporter) -> RenderResult;
}

/// Lets a running render publish its completion percentage.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    queue: Arc<RenderQueue>,
    job_id: JobId,
}

impl ProgressReporter {
    pub(crate) fn new(queue: Arc<RenderQueue>, job_id: JobId) -> Self {
        Self { queue, job_id }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Store `percent` on the job and publish `JobProgress`. Reports for a
    /// job that is no longer processing are dropped.
    pub fn report(&self, percent: u8) {
        if let Err(err) = self.queue.report_progress(&self.job_id, percent) {
            tracing::debug!(job_id = %self.job_id, error = %err, "progress report ignored");
        }
    }
}
