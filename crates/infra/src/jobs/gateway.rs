//! Submission gateway: validate, create, publish. Also hosts the two
//! operator actions, cancel and manual retry.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use docflow_analysis::LocalDocuments;
use docflow_broker::Broker;
use docflow_core::{DomainError, FileRef, IdempotencyKey, Job, JobId, JobPatch, JobState, NewJob};

use super::store::{JobStore, StoreError};

pub const CANCELLED_MESSAGE: &str = "cancelled by request";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Store(other),
        }
    }
}

impl From<DomainError> for GatewayError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => GatewayError::Validation(msg),
            other => GatewayError::Validation(other.to_string()),
        }
    }
}

/// One submission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub query: String,
    pub file_ref: FileRef,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl Submission {
    pub fn new(query: impl Into<String>, file_ref: impl Into<FileRef>) -> Self {
        Self {
            query: query.into(),
            file_ref: file_ref.into(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub job_id: JobId,
    /// The idempotency key already named this job; nothing was created.
    pub existed: bool,
}

pub struct SubmissionGateway {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    documents: LocalDocuments,
    max_attempts: u32,
}

impl std::fmt::Debug for SubmissionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionGateway")
            .field("documents", &self.documents)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl SubmissionGateway {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        documents: LocalDocuments,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            broker,
            documents,
            max_attempts,
        }
    }

    pub fn documents(&self) -> &LocalDocuments {
        &self.documents
    }

    /// Create a `Pending` job and publish it, or return the job already
    /// holding the submission's idempotency key.
    #[instrument(skip(self, submission), fields(file_ref = %submission.file_ref), err)]
    pub async fn submit(&self, submission: Submission) -> Result<Submitted, GatewayError> {
        let new = NewJob::new(
            submission.query,
            submission.file_ref,
            submission.idempotency_key,
            self.max_attempts,
        )?;

        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                info!(job_id = %existing.id, "idempotency key reused; returning existing job");
                return Ok(Submitted {
                    job_id: existing.id,
                    existed: true,
                });
            }
        }

        self.documents
            .resolve(&new.file_ref)
            .await
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let created = self.store.create(new).await?;
        if created.existed {
            return Ok(Submitted {
                job_id: created.job.id,
                existed: true,
            });
        }

        let job_id = created.job.id;
        match self.broker.publish(job_id).await {
            Ok(()) => info!(job_id = %job_id, "job submitted"),
            Err(err) => warn!(job_id = %job_id, error = %err, "publish failed; stale-pending sweep will republish"),
        }
        Ok(Submitted {
            job_id,
            existed: false,
        })
    }

    /// `Running → Failed{Cancelled}`. The worker discards its result when it
    /// finishes.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: JobId) -> Result<Job, GatewayError> {
        match self
            .store
            .transition(id, JobState::Running, JobState::Failed, JobPatch::cancel(CANCELLED_MESSAGE))
            .await
        {
            Ok(job) => {
                info!(job_id = %id, attempt = job.attempt, "job cancelled");
                Ok(job)
            }
            Err(StoreError::Conflict { actual, .. }) => Err(GatewayError::Conflict(format!(
                "job {id} is {actual}; only running jobs can be cancelled"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// `Failed → Pending` and republish, while the attempt budget allows.
    #[instrument(skip(self), err)]
    pub async fn retry(&self, id: JobId) -> Result<Job, GatewayError> {
        let job = match self
            .store
            .transition(id, JobState::Failed, JobState::Pending, JobPatch::retry())
            .await
        {
            Ok(job) => job,
            Err(StoreError::Conflict { actual, .. }) => {
                return Err(GatewayError::Conflict(format!(
                    "job {id} is {actual}; only failed jobs can be retried"
                )));
            }
            Err(StoreError::IllegalTransition(err)) => {
                return Err(GatewayError::Conflict(format!("job {id} cannot be retried: {err}")));
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.broker.publish(id).await {
            warn!(job_id = %id, error = %err, "publish failed; stale-pending sweep will republish");
        }
        info!(job_id = %id, attempt = job.attempt, "job retried");
        Ok(job)
    }
}
