//! The analysis job record and its state machine.
//!
//! Every store applies transitions through [`Job::apply`], so edge legality and
//! patch consistency are decided here once, independent of the backing engine.
//! Stores add the compare-and-swap part: the stored `state` must equal the
//! caller's expected state and the [`LeaseGuard`] must admit the stored lease.
//!
//! ```text
//! Pending ──claim──▶ Running ──result──▶ Completed
//!    ▲                 │  │
//!    └──requeue/reap───┘  └──error──▶ Failed ──retry──▶ Pending
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{FileRef, IdempotencyKey, JobId, WorkerId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed by a worker
    Pending,
    /// Claimed by a worker holding a lease
    Running,
    /// Finished successfully; absorbing
    Completed,
    /// Finished with an error; may be retried while attempts remain
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Whether the job has an outcome readers can show (result or error).
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Edges of the state machine, ignoring attempt accounting.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        matches!(
            (self, to),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Pending)
                | (JobState::Failed, JobState::Pending)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!(
                "unknown job state '{other}' (expected pending, running, completed or failed)"
            ))),
        }
    }
}

/// Time-bounded claim of a worker on a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: WorkerId, expires_at: DateTime<Utc>) -> Self {
        Self { owner, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Output of a successful analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_text: String,
    pub artifact_path: String,
    /// Wall time of the attempt that produced this result.
    pub processing_ms: u64,
}

/// Classification of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, unavailable dependency, crash; retried until attempts run out
    Transient,
    /// Bad input to the analysis; never retried automatically
    Permanent,
    /// Cancelled while running
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for FailureKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            "cancelled" => Ok(FailureKind::Cancelled),
            other => Err(DomainError::validation(format!("unknown failure kind '{other}'"))),
        }
    }
}

/// User-visible error payload of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }
}

/// Validated input for creating a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub query: String,
    pub file_ref: FileRef,
    pub idempotency_key: Option<IdempotencyKey>,
    pub max_attempts: u32,
}

impl NewJob {
    /// Trims the query and rejects empty queries, empty file refs and a zero attempt budget.
    pub fn new(
        query: impl Into<String>,
        file_ref: FileRef,
        idempotency_key: Option<IdempotencyKey>,
        max_attempts: u32,
    ) -> DomainResult<Self> {
        let query = query.into().trim().to_string();
        if query.is_empty() {
            return Err(DomainError::validation("query must not be empty"));
        }
        if file_ref.as_str().trim().is_empty() {
            return Err(DomainError::validation("file_ref must not be empty"));
        }
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        let idempotency_key = idempotency_key.filter(|k| !k.as_str().trim().is_empty());
        Ok(Self {
            query,
            file_ref,
            idempotency_key,
            max_attempts,
        })
    }
}

/// Durable record of a submitted analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub query: String,
    pub file_ref: FileRef,
    pub idempotency_key: Option<IdempotencyKey>,
    pub state: JobState,
    /// Execution attempts so far; incremented on every claim.
    pub attempt: u32,
    pub max_attempts: u32,
    pub result: Option<AnalysisResult>,
    pub error: Option<ErrorInfo>,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lease condition a transition must satisfy against the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGuard {
    /// No lease condition.
    Any,
    /// The stored lease must be owned by this worker.
    HeldBy(WorkerId),
    /// The stored lease must have expired before this instant.
    ExpiredBefore(DateTime<Utc>),
}

/// Changes carried by a transition, plus the lease guard fencing it.
///
/// Entering `Running` always increments `attempt`; leaving `Running` always
/// clears the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPatch {
    pub guard: LeaseGuard,
    pub lease: Option<Lease>,
    pub result: Option<AnalysisResult>,
    pub error: Option<ErrorInfo>,
}

impl JobPatch {
    fn guarded(guard: LeaseGuard) -> Self {
        Self {
            guard,
            lease: None,
            result: None,
            error: None,
        }
    }

    /// `Pending → Running`: take the lease.
    pub fn claim(owner: WorkerId, expires_at: DateTime<Utc>) -> Self {
        Self {
            lease: Some(Lease::new(owner, expires_at)),
            ..Self::guarded(LeaseGuard::Any)
        }
    }

    /// `Running → Completed` by the lease owner.
    pub fn complete(owner: WorkerId, result: AnalysisResult) -> Self {
        Self {
            result: Some(result),
            ..Self::guarded(LeaseGuard::HeldBy(owner))
        }
    }

    /// `Running → Failed` by the lease owner.
    pub fn fail(owner: WorkerId, error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::guarded(LeaseGuard::HeldBy(owner))
        }
    }

    /// `Running → Pending` by the lease owner (transient failure, attempts left).
    pub fn requeue(owner: WorkerId) -> Self {
        Self::guarded(LeaseGuard::HeldBy(owner))
    }

    /// `Running → Pending` by the reaper; only if the lease is still stale at `now`.
    pub fn reclaim(now: DateTime<Utc>) -> Self {
        Self::guarded(LeaseGuard::ExpiredBefore(now))
    }

    /// `Running → Failed` by the reaper when the stale attempt was the last one.
    pub fn expire(now: DateTime<Utc>, error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::guarded(LeaseGuard::ExpiredBefore(now))
        }
    }

    /// `Running → Failed{Cancelled}` from outside the worker.
    pub fn cancel(message: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorInfo::cancelled(message)),
            ..Self::guarded(LeaseGuard::Any)
        }
    }

    /// `Failed → Pending`.
    pub fn retry() -> Self {
        Self::guarded(LeaseGuard::Any)
    }

    /// Whether `from → to` is an edge and this patch carries exactly what `to` needs.
    ///
    /// Independent of any stored record, so stores run it before the CAS precondition.
    pub fn check_edge(&self, from: JobState, to: JobState) -> DomainResult<()> {
        if !from.can_transition_to(to) {
            return Err(DomainError::illegal(from, to, "not an edge of the job state machine"));
        }
        match (to, self.lease.is_some()) {
            (JobState::Running, false) => {
                return Err(DomainError::illegal(from, to, "entering running requires a lease"));
            }
            (JobState::Running, true) | (_, false) => {}
            (_, true) => {
                return Err(DomainError::illegal(from, to, "a lease may only be set on entering running"));
            }
        }
        match (to, self.result.is_some()) {
            (JobState::Completed, false) => {
                return Err(DomainError::illegal(from, to, "entering completed requires a result"));
            }
            (JobState::Completed, true) | (_, false) => {}
            (_, true) => {
                return Err(DomainError::illegal(from, to, "a result may only be set on entering completed"));
            }
        }
        match (to, self.error.is_some()) {
            (JobState::Failed, false) => Err(DomainError::illegal(from, to, "entering failed requires an error")),
            (JobState::Failed, true) | (_, false) => Ok(()),
            (_, true) => Err(DomainError::illegal(from, to, "an error may only be set on entering failed")),
        }
    }
}

impl Job {
    /// Build the initial `Pending` record.
    pub fn create(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            query: new.query,
            file_ref: new.file_ref,
            idempotency_key: new.idempotency_key,
            state: JobState::Pending,
            attempt: 0,
            max_attempts: new.max_attempts,
            result: None,
            error: None,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn lease_held_by(&self, owner: &WorkerId) -> bool {
        self.state == JobState::Running
            && self.lease.as_ref().is_some_and(|l| &l.owner == owner)
    }

    /// Compare-and-swap precondition: stored state and lease guard.
    pub fn admits(&self, expected: JobState, guard: &LeaseGuard) -> bool {
        if self.state != expected {
            return false;
        }
        match guard {
            LeaseGuard::Any => true,
            LeaseGuard::HeldBy(owner) => self.lease.as_ref().is_some_and(|l| &l.owner == owner),
            LeaseGuard::ExpiredBefore(now) => self.lease.as_ref().is_some_and(|l| l.is_expired(*now)),
        }
    }

    /// Produce the record after moving to `to` with `patch`.
    ///
    /// Checks the edge, the attempt budget and that the patch matches the target
    /// state. Does not check the CAS precondition; see [`Job::admits`].
    pub fn apply(&self, to: JobState, patch: JobPatch, now: DateTime<Utc>) -> DomainResult<Job> {
        let from = self.state;
        patch.check_edge(from, to)?;

        let mut next = self.clone();
        next.state = to;
        next.updated_at = now;

        match to {
            JobState::Running => {
                if !self.attempts_remaining() {
                    return Err(self.budget_exhausted(to));
                }
                next.attempt = self.attempt + 1;
                next.lease = patch.lease;
            }
            JobState::Completed => {
                next.result = patch.result;
                next.lease = None;
            }
            JobState::Failed => {
                next.error = patch.error;
                next.lease = None;
            }
            JobState::Pending => {
                if !self.attempts_remaining() {
                    return Err(self.budget_exhausted(to));
                }
                next.error = None;
                next.lease = None;
            }
        }

        Ok(next)
    }

    fn budget_exhausted(&self, to: JobState) -> DomainError {
        DomainError::illegal(
            self.state,
            to,
            format!("attempt budget exhausted ({}/{})", self.attempt, self.max_attempts),
        )
    }

    /// Extend the lease of a running job owned by `owner`.
    ///
    /// Returns `None` when the job is not running or the lease belongs to someone else.
    pub fn renewed(&self, owner: &WorkerId, expires_at: DateTime<Utc>) -> Option<Job> {
        if !self.lease_held_by(owner) {
            return None;
        }
        let mut next = self.clone();
        next.lease = Some(Lease::new(owner.clone(), expires_at));
        Some(next)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            state: self.state,
            attempt: self.attempt,
            query: self.query.clone(),
            file_ref: self.file_ref.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing projection of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub query: String,
    pub file_ref: FileRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
