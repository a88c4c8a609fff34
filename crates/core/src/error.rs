//! Domain error model.

use thiserror::Error;

use crate::job::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, illegal state
/// changes, malformed identifiers). Storage and transport concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty query).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested state change is not an edge of the job state machine,
    /// or the patch is inconsistent with the target state.
    #[error("illegal transition {from:?} -> {to:?}: {reason}")]
    IllegalTransition {
        from: JobState,
        to: JobState,
        reason: String,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn illegal(from: JobState, to: JobState, reason: impl Into<String>) -> Self {
        Self::IllegalTransition {
            from,
            to,
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
