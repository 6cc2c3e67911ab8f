//! Priority render queue with a concurrency gate.
//!
//! Callers admit jobs, render workers subscribe to `ProcessJob` events and
//! report back with [`RenderQueue::complete`] or [`RenderQueue::fail`]. The
//! queue keeps at most `max_concurrent_renders` jobs processing, retries
//! failures according to its [`RetryPolicy`] and publishes every lifecycle
//! transition as a [`JobEvent`].

pub mod config;
pub mod error;
pub mod event;
pub mod order;
pub mod queue;
pub mod retry;
pub mod status;
pub mod store;
pub mod tick;
pub mod types;

pub use config::{ConfigError, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use event::{JobEvent, JobEventKind};
pub use queue::{RenderQueue, TickReport};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use status::{ProjectSummary, QueueStatus, StatusCounts};
pub use store::{FailureOutcome, JobTable};
pub use tick::SafetyNetTick;
pub use types::{FailureInfo, Job, JobMetadata, JobStatus, NewJob};
