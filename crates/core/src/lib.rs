//! Identifiers and validation shared by every renderq crate.
//!
//! This crate contains no scheduling logic; it only defines the vocabulary
//! (job, project and template identifiers) the queue and its collaborators speak.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, ProjectId, TemplateId};
