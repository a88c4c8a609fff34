use std::sync::Arc;

use async_trait::async_trait;
use docflow_core::{AnalysisResult, FileRef, JobId};

use crate::error::AnalysisError;

/// Input of one analysis attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub file_ref: FileRef,
    pub query: String,
    /// 1-based attempt number this call belongs to.
    pub attempt: u32,
}

/// The opaque, long-running analysis function.
///
/// Implementations must be safe to invoke again for the same job: side effects
/// of a re-attempt overwrite or tolerate those of earlier attempts.
/// Provider throttling is absorbed inside; callers only ever see the
/// retryable/permanent classification.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError>;
}

#[async_trait]
impl<A> Analyzer for Arc<A>
where
    A: Analyzer + ?Sized,
{
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        (**self).analyze(request).await
    }
}
