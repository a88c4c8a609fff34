use thiserror::Error;

/// Failure of one analysis attempt.
///
/// The variant is the retry decision: the worker pool requeues `Retryable`
/// failures while attempts remain and fails the job immediately on `Permanent`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// Timeout, throttling, dependency unavailable.
    #[error("retryable analysis failure: {0}")]
    Retryable(String),

    /// Malformed input, unsupported or missing document, rejected prompt.
    #[error("permanent analysis failure: {0}")]
    Permanent(String),
}

impl AnalysisError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Permanent(m) => m,
        }
    }
}
