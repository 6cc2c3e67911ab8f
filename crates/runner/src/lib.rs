//! Runs render workers against a [`renderq_queue::RenderQueue`].

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{DispatcherHandle, RenderDispatcher};
pub use worker::{ProgressReporter, RenderResult, RenderWorker};
