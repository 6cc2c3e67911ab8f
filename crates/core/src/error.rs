//! Core error model.

use thiserror::Error;

/// Result type used for identifier parsing and validation.
pub type CoreResult<T> = Result<T, CoreError>;

/// Validation failures for caller-supplied values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was empty or otherwise malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
