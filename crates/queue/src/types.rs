//! Job records and the values callers hand to the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use renderq_core::{JobId, ProjectId, TemplateId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for a free render slot
    Pending,
    /// Handed to a render worker
    Processing,
    /// Rendered successfully
    Completed,
    /// Failed and out of retries
    Failed,
    /// Withdrawn while still pending
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the queue knows about a job besides its identity and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub project_id: Option<ProjectId>,
    pub template_id: Option<TemplateId>,
    /// Source row in the uploaded dataset.
    pub row_index: Option<u64>,
    pub row_data: Value,
    pub output_path: Option<String>,
    pub output_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Earliest dispatch time after a retry with backoff.
    pub not_before: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Render progress in percent, as last reported by the worker.
    pub progress: u8,
    /// Short message of the most recent failure.
    pub error: Option<String>,
    /// Full diagnostic text of the most recent failure.
    pub error_details: Option<String>,
    /// Output reference of a completed render (e.g. file path).
    pub result: Option<String>,
    /// Caller-defined fields carried through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// A render job as tracked by the queue.
///
/// Values handed out by the queue are snapshots; mutating them has no effect
/// on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Higher dispatches earlier.
    pub priority: i64,
    pub status: JobStatus,
    /// Opaque render instructions (template, assets, output), passed to the worker.
    pub payload: Value,
    pub metadata: JobMetadata,
}

impl Job {
    pub fn project_id(&self) -> Option<&ProjectId> {
        self.metadata.project_id.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count
    }

    /// Whether a pending job may be dispatched at `now` (retry backoff elapsed).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.metadata.not_before.is_none_or(|at| now >= at)
    }

    pub(crate) fn belongs_to(&self, project_id: &ProjectId) -> bool {
        self.metadata.project_id.as_ref() == Some(project_id)
    }
}

/// Admission request: what a caller knows about a job before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub priority: i64,
    pub payload: Value,
    pub project_id: Option<ProjectId>,
    pub template_id: Option<TemplateId>,
    pub row_index: Option<u64>,
    pub row_data: Value,
    pub output_path: Option<String>,
    pub output_filename: Option<String>,
    pub extra: Map<String, Value>,
}

impl NewJob {
    pub fn new(id: JobId, payload: Value) -> Self {
        Self {
            id,
            priority: 0,
            payload,
            project_id: None,
            template_id: None,
            row_index: None,
            row_data: Value::Null,
            output_path: None,
            output_filename: None,
            extra: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }

    /// Attach the dataset row this job renders.
    pub fn with_row(mut self, index: u64, data: Value) -> Self {
        self.row_index = Some(index);
        self.row_data = data;
        self
    }

    pub fn with_output(mut self, path: impl Into<String>, filename: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self.output_filename = Some(filename.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub(crate) fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            priority: self.priority,
            status: JobStatus::Pending,
            payload: self.payload,
            metadata: JobMetadata {
                project_id: self.project_id,
                template_id: self.template_id,
                row_index: self.row_index,
                row_data: self.row_data,
                output_path: self.output_path,
                output_filename: self.output_filename,
                created_at: now,
                started_at: None,
                completed_at: None,
                failed_at: None,
                cancelled_at: None,
                not_before: None,
                retry_count: 0,
                progress: 0,
                error: None,
                error_details: None,
                result: None,
                extra: self.extra,
            },
        }
    }
}

/// What a render worker reports when a job fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    pub details: Option<String>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Build from an error, keeping its whole `source()` chain as details.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut details = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            details.push_str("\ncaused by: ");
            details.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            details: Some(details),
        }
    }

    /// Details to record; falls back to the message when none were given.
    pub(crate) fn details_or_message(&self) -> String {
        self.details.clone().unwrap_or_else(|| self.message.clone())
    }
}

impl From<&str> for FailureInfo {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FailureInfo {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
