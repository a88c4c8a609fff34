//! In-process job state-change notifications.
//!
//! A lossy broadcast: slow subscribers lag and miss events, publishers never
//! block. Polling the store remains the source of truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use docflow_core::{IdempotencyKey, Job, JobId, JobPatch, JobState, NewJob, WorkerId};

use super::store::{Created, JobStats, JobStore, StoreResult};

const DEFAULT_CAPACITY: usize = 1024;

/// One observed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            attempt: job.attempt,
            at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl JobEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received it.
    pub fn emit(&self, job: &Job) -> usize {
        self.tx.send(JobEvent::of(job)).unwrap_or(0)
    }
}

/// Store decorator emitting a [`JobEvent`] after every successful write.
#[derive(Debug, Clone)]
pub struct NotifyingJobStore<S> {
    inner: S,
    events: JobEvents,
}

impl<S: JobStore> NotifyingJobStore<S> {
    pub fn new(inner: S, events: JobEvents) -> Self {
        Self { inner, events }
    }

    pub fn events(&self) -> &JobEvents {
        &self.events
    }
}

#[async_trait]
impl<S: JobStore> JobStore for NotifyingJobStore<S> {
    async fn create(&self, new: NewJob) -> StoreResult<Created> {
        let created = self.inner.create(new).await?;
        if !created.existed {
            self.events.emit(&created.job);
        }
        Ok(created)
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        self.inner.get(id).await
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> StoreResult<Option<Job>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> StoreResult<Job> {
        let job = self.inner.transition(id, expected, to, patch).await?;
        self.events.emit(&job);
        Ok(job)
    }

    // Renewals are not state changes.
    async fn renew_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Job> {
        self.inner.renew_lease(id, owner, expires_at).await
    }

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        self.inner.list(state).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.inner.expired_leases(now, limit).await
    }

    async fn stale_pending(&self, updated_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.inner.stale_pending(updated_before, limit).await
    }

    async fn stats(&self) -> StoreResult<JobStats> {
        self.inner.stats().await
    }
}
