//! Column encoding shared by the SQL job stores.

use chrono::{DateTime, Utc};
use docflow_core::{
    AnalysisResult, ErrorInfo, FailureKind, FileRef, IdempotencyKey, Job, JobId, JobState, Lease,
    WorkerId,
};

use super::store::StoreError;

/// Compare-and-swap rounds before a contended write gives up.
pub(crate) const MAX_CAS_ROUNDS: usize = 8;

/// One `jobs` row as read back from SQL, engine types already converted.
#[derive(Debug)]
pub(crate) struct JobRow {
    pub id: JobId,
    pub query: String,
    pub file_ref: String,
    pub idempotency_key: Option<String>,
    pub state: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub result_text: Option<String>,
    pub artifact_path: Option<String>,
    pub processing_ms: Option<i64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

fn corrupt(id: JobId, what: &str) -> StoreError {
    StoreError::Storage(format!("corrupt row for job {id}: {what}"))
}

impl JobRow {
    /// Rebuild the job, returning it with the row version used for the next CAS.
    pub fn into_job(self) -> Result<(Job, i64), StoreError> {
        let id = self.id;
        let state: JobState = self
            .state
            .parse()
            .map_err(|_| corrupt(id, &format!("unknown state '{}'", self.state)))?;

        let result = match (self.result_text, self.artifact_path) {
            (Some(analysis_text), Some(artifact_path)) => Some(AnalysisResult {
                analysis_text,
                artifact_path,
                processing_ms: u64::try_from(self.processing_ms.unwrap_or(0)).unwrap_or(0),
            }),
            (None, None) => None,
            _ => return Err(corrupt(id, "partial result columns")),
        };

        let error = match (self.error_kind, self.error_message) {
            (Some(kind), Some(message)) => {
                let kind: FailureKind = kind
                    .parse()
                    .map_err(|_| corrupt(id, &format!("unknown failure kind '{kind}'")))?;
                Some(ErrorInfo { kind, message })
            }
            (None, None) => None,
            _ => return Err(corrupt(id, "partial error columns")),
        };

        let lease = match (self.lease_owner, self.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease::new(WorkerId::new(owner), expires_at)),
            (None, None) => None,
            _ => return Err(corrupt(id, "partial lease columns")),
        };

        let attempt = u32::try_from(self.attempt).map_err(|_| corrupt(id, "attempt out of range"))?;
        let max_attempts =
            u32::try_from(self.max_attempts).map_err(|_| corrupt(id, "max_attempts out of range"))?;

        Ok((
            Job {
                id,
                query: self.query,
                file_ref: FileRef::new(self.file_ref),
                idempotency_key: self.idempotency_key.map(IdempotencyKey::new),
                state,
                attempt,
                max_attempts,
                result,
                error,
                lease,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
            self.version,
        ))
    }
}

/// Mutable columns of a job, ready to bind.
#[derive(Debug)]
pub(crate) struct MutableColumns<'a> {
    pub state: &'static str,
    pub attempt: i64,
    pub result_text: Option<&'a str>,
    pub artifact_path: Option<&'a str>,
    pub processing_ms: Option<i64>,
    pub error_kind: Option<&'static str>,
    pub error_message: Option<&'a str>,
    pub lease_owner: Option<&'a str>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl<'a> MutableColumns<'a> {
    pub fn of(job: &'a Job) -> Self {
        Self {
            state: job.state.as_str(),
            attempt: i64::from(job.attempt),
            result_text: job.result.as_ref().map(|r| r.analysis_text.as_str()),
            artifact_path: job.result.as_ref().map(|r| r.artifact_path.as_str()),
            processing_ms: job
                .result
                .as_ref()
                .map(|r| i64::try_from(r.processing_ms).unwrap_or(i64::MAX)),
            error_kind: job.error.as_ref().map(|e| e.kind.as_str()),
            error_message: job.error.as_ref().map(|e| e.message.as_str()),
            lease_owner: job.lease.as_ref().map(|l| l.owner.as_str()),
            lease_expires_at: job.lease.as_ref().map(|l| l.expires_at),
            updated_at: job.updated_at,
        }
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: JobId::new(),
            query: "Summarize".to_string(),
            file_ref: "sample.pdf".to_string(),
            idempotency_key: None,
            state: "running".to_string(),
            attempt: 1,
            max_attempts: 3,
            result_text: None,
            artifact_path: None,
            processing_ms: None,
            error_kind: None,
            error_message: None,
            lease_owner: Some("w1".to_string()),
            lease_expires_at: Some(now),
            created_at: now,
            updated_at: now,
            version: 4,
        }
    }

    #[test]
    fn decodes_running_row() {
        let (job, version) = row().into_job().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.lease_held_by(&WorkerId::new("w1")));
        assert_eq!(version, 4);
    }

    #[test]
    fn half_written_lease_is_corrupt() {
        let mut r = row();
        r.lease_expires_at = None;
        assert!(matches!(r.into_job(), Err(StoreError::Storage(_))));
    }

    #[test]
    fn unknown_state_is_corrupt() {
        let mut r = row();
        r.state = "queued".to_string();
        assert!(matches!(r.into_job(), Err(StoreError::Storage(_))));
    }

    #[test]
    fn mutable_columns_follow_the_job() {
        let (job, _) = row().into_job().unwrap();
        let cols = MutableColumns::of(&job);
        assert_eq!(cols.state, "running");
        assert_eq!(cols.lease_owner, Some("w1"));
        assert!(cols.error_kind.is_none());
    }
}
