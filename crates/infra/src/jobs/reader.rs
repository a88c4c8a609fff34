//! Read-only views over the job store: status, result, listing, counts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use docflow_core::{AnalysisResult, ErrorInfo, Job, JobId, JobState, JobSummary};

use super::store::{JobStats, JobStore, StoreError};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReaderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ReaderError::NotFound(id),
            other => ReaderError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of `result(id)`: data only when `Completed`, the error only when `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResultView {
    Ready(AnalysisResult),
    NotReady(JobState),
    Failed(ErrorInfo),
}

impl JobResultView {
    pub fn of(job: &Job) -> Self {
        match (job.state, &job.result, &job.error) {
            (JobState::Completed, Some(result), _) => JobResultView::Ready(result.clone()),
            (JobState::Failed, _, Some(error)) => JobResultView::Failed(error.clone()),
            (state, _, _) => JobResultView::NotReady(state),
        }
    }
}

#[derive(Clone)]
pub struct StatusReader {
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for StatusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReader").finish_non_exhaustive()
    }
}

impl StatusReader {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView, ReaderError> {
        let job = self.store.get(id).await?;
        Ok(JobStatusView {
            job_id: job.id,
            state: job.state,
            attempt: job.attempt,
            updated_at: job.updated_at,
        })
    }

    pub async fn result(&self, id: JobId) -> Result<JobResultView, ReaderError> {
        Ok(JobResultView::of(&self.store.get(id).await?))
    }

    /// Full record, for operators.
    pub async fn job(&self, id: JobId) -> Result<Job, ReaderError> {
        Ok(self.store.get(id).await?)
    }

    /// Summaries in creation order.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<JobSummary>, ReaderError> {
        Ok(self
            .store
            .list(state)
            .await?
            .iter()
            .map(Job::summary)
            .collect())
    }

    pub async fn stats(&self) -> Result<JobStats, ReaderError> {
        Ok(self.store.stats().await?)
    }
}
