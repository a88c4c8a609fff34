//! Job store contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use docflow_core::{DomainError, IdempotencyKey, Job, JobId, JobPatch, JobState, NewJob, WorkerId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Compare-and-swap precondition failed; nothing was written.
    #[error("conflict on job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    /// The patch does not fit the requested edge; nothing was written.
    #[error(transparent)]
    IllegalTransition(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Failures worth retrying locally (the backing store may come back).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

/// Result of [`JobStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub job: Job,
    /// `true` when the idempotency key already named a job, which is returned unchanged.
    pub existed: bool,
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Running => self.running += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
    }
}

/// Durable record of every job; the single source of truth.
///
/// `transition` is the only way to change a job's state. It is a
/// compare-and-swap: the stored state must equal `expected` and the patch's
/// lease guard must hold, otherwise it returns [`StoreError::Conflict`] and
/// writes nothing. Each successful call is one atomic write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` job, or return the job already holding its idempotency key.
    async fn create(&self, new: NewJob) -> StoreResult<Created>;

    async fn get(&self, id: JobId) -> StoreResult<Job>;

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> StoreResult<Option<Job>>;

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> StoreResult<Job>;

    /// Move the lease expiry of a running job owned by `owner`.
    async fn renew_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Job>;

    /// Jobs in insertion order, optionally restricted to one state.
    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>>;

    /// Running jobs whose lease expired before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>>;

    /// Pending jobs not updated since `updated_before`.
    async fn stale_pending(&self, updated_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>>;

    async fn stats(&self) -> StoreResult<JobStats>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, new: NewJob) -> StoreResult<Created> {
        (**self).create(new).await
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        (**self).get(id).await
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> StoreResult<Option<Job>> {
        (**self).find_by_idempotency_key(key).await
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> StoreResult<Job> {
        (**self).transition(id, expected, to, patch).await
    }

    async fn renew_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Job> {
        (**self).renew_lease(id, owner, expires_at).await
    }

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        (**self).list(state).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        (**self).expired_leases(now, limit).await
    }

    async fn stale_pending(&self, updated_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        (**self).stale_pending(updated_before, limit).await
    }

    async fn stats(&self) -> StoreResult<JobStats> {
        (**self).stats().await
    }
}

/// Millisecond precision, the resolution every store persists.
pub(crate) fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

pub(crate) fn store_now() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

/// `now + span`, saturating at the latest representable instant.
pub(crate) fn instant_after(now: DateTime<Utc>, span: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - span`, saturating at the earliest representable instant.
pub(crate) fn instant_before(now: DateTime<Utc>, span: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Shared CAS decision: edge check, precondition check, then the pure transition.
///
/// A request that could never succeed is `IllegalTransition` whatever is stored;
/// `Conflict` only means the stored record moved on.
pub(crate) fn decide_transition(
    current: &Job,
    expected: JobState,
    to: JobState,
    mut patch: JobPatch,
    now: DateTime<Utc>,
) -> StoreResult<Job> {
    patch.check_edge(expected, to)?;
    if let Some(lease) = patch.lease.as_mut() {
        lease.expires_at = truncate_millis(lease.expires_at);
    }
    if !current.admits(expected, &patch.guard) {
        return Err(StoreError::Conflict {
            id: current.id,
            expected,
            actual: current.state,
        });
    }
    Ok(current.apply(to, patch, now)?)
}

/// Error for a CAS that kept losing the version race: what the caller expected,
/// and the last state it saw.
pub(crate) fn contention(id: JobId, expected: JobState, last_seen: JobState) -> StoreError {
    StoreError::Conflict {
        id,
        expected,
        actual: last_seen,
    }
}

pub(crate) fn decide_renewal(
    current: &Job,
    owner: &WorkerId,
    expires_at: DateTime<Utc>,
) -> StoreResult<Job> {
    current.renewed(owner, truncate_millis(expires_at)).ok_or(StoreError::Conflict {
        id: current.id,
        expected: JobState::Running,
        actual: current.state,
    })
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    keys: HashMap<IdempotencyKey, JobId>,
}

/// In-memory job store for tests/dev.
///
/// One write lock covers every mutation, which makes each call atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("in-memory job store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("in-memory job store lock poisoned".to_string()))
    }

    fn collect<F>(&self, limit: usize, filter: F) -> StoreResult<Vec<Job>>
    where
        F: Fn(&Job) -> bool,
    {
        let inner = self.read()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| filter(job))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob) -> StoreResult<Created> {
        let mut inner = self.write()?;

        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = inner.keys.get(key).and_then(|id| inner.jobs.get(id)) {
                return Ok(Created {
                    job: existing.clone(),
                    existed: true,
                });
            }
        }

        let job = Job::create(JobId::new(), new, store_now());
        if let Some(key) = &job.idempotency_key {
            inner.keys.insert(key.clone(), job.id);
        }
        inner.order.push(job.id);
        inner.jobs.insert(job.id, job.clone());

        Ok(Created { job, existed: false })
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        self.read()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> StoreResult<Option<Job>> {
        let inner = self.read()?;
        Ok(inner.keys.get(key).and_then(|id| inner.jobs.get(id)).cloned())
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> StoreResult<Job> {
        let mut inner = self.write()?;
        let current = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        let next = decide_transition(current, expected, to, patch, store_now())?;
        inner.jobs.insert(id, next.clone());
        Ok(next)
    }

    async fn renew_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Job> {
        let mut inner = self.write()?;
        let current = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        let next = decide_renewal(current, owner, expires_at)?;
        inner.jobs.insert(id, next.clone());
        Ok(next)
    }

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        self.collect(usize::MAX, |job| state.is_none_or(|s| job.state == s))
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.collect(limit, |job| {
            job.state == JobState::Running && job.lease.as_ref().is_some_and(|l| l.is_expired(now))
        })
    }

    async fn stale_pending(&self, updated_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.collect(limit, |job| {
            job.state == JobState::Pending && job.updated_at < updated_before
        })
    }

    async fn stats(&self) -> StoreResult<JobStats> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::contract;

    #[test]
    fn contention_reports_the_callers_expectation() {
        let id = JobId::new();
        let err = contention(id, JobState::Running, JobState::Failed);
        assert_eq!(
            err,
            StoreError::Conflict {
                id,
                expected: JobState::Running,
                actual: JobState::Failed,
            }
        );
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn in_memory_store_honours_the_contract() {
        contract::run_all(|| async { Arc::new(InMemoryJobStore::new()) as Arc<dyn JobStore> }).await;
    }
}
