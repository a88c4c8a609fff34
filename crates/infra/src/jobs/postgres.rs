//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | Situation | StoreError |
//! |-----------|------------|
//! | no row for the id | `NotFound` |
//! | stored state or lease guard does not match | `Conflict` |
//! | patch inconsistent with the target state | `IllegalTransition` |
//! | database, pool or network failure | `Storage` |
//!
//! ## Concurrency
//!
//! Same scheme as the SQLite store: every write bumps `version` and is
//! conditioned on the version it was decided from. Idempotent creation relies
//! on the unique index on `idempotency_key` (`ON CONFLICT DO NOTHING`).

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{FromRow, Row};
use tracing::{debug, instrument, Span};
use uuid::Uuid;

use docflow_core::{IdempotencyKey, Job, JobId, JobPatch, JobState, NewJob, WorkerId};

use super::row::{map_sqlx_error, JobRow, MutableColumns, MAX_CAS_ROUNDS};
use super::store::{
    contention, decide_renewal, decide_transition, store_now, Created, JobStats, JobStore, StoreError, StoreResult,
};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq              BIGSERIAL   PRIMARY KEY,
        id               UUID        NOT NULL UNIQUE,
        query            TEXT        NOT NULL,
        file_ref         TEXT        NOT NULL,
        idempotency_key  TEXT        UNIQUE,
        state            TEXT        NOT NULL CHECK (state IN ('pending', 'running', 'completed', 'failed')),
        attempt          INTEGER     NOT NULL CHECK (attempt >= 0),
        max_attempts     INTEGER     NOT NULL CHECK (max_attempts >= 1),
        result_text      TEXT,
        artifact_path    TEXT,
        processing_ms    BIGINT,
        error_kind       TEXT,
        error_message    TEXT,
        lease_owner      TEXT,
        lease_expires_at TIMESTAMPTZ,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL,
        version          BIGINT      NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_state_lease_idx ON jobs (state, lease_expires_at)",
    "CREATE INDEX IF NOT EXISTS jobs_state_updated_idx ON jobs (state, updated_at)",
];

const SELECT_COLUMNS: &str = "id, query, file_ref, idempotency_key, state, attempt, max_attempts, \
     result_text, artifact_path, processing_ms, error_kind, error_message, \
     lease_owner, lease_expires_at, created_at, updated_at, version";

/// Postgres-backed job store.
///
/// `Send + Sync`; all operations go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

#[derive(Debug)]
struct PgJobRow {
    id: Uuid,
    query: String,
    file_ref: String,
    idempotency_key: Option<String>,
    state: String,
    attempt: i32,
    max_attempts: i32,
    result_text: Option<String>,
    artifact_path: Option<String>,
    processing_ms: Option<i64>,
    error_kind: Option<String>,
    error_message: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for PgJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            query: row.try_get("query")?,
            file_ref: row.try_get("file_ref")?,
            idempotency_key: row.try_get("idempotency_key")?,
            state: row.try_get("state")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            result_text: row.try_get("result_text")?,
            artifact_path: row.try_get("artifact_path")?,
            processing_ms: row.try_get("processing_ms")?,
            error_kind: row.try_get("error_kind")?,
            error_message: row.try_get("error_message")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl From<PgJobRow> for JobRow {
    fn from(row: PgJobRow) -> Self {
        JobRow {
            id: JobId::from_uuid(row.id),
            query: row.query,
            file_ref: row.file_ref,
            idempotency_key: row.idempotency_key,
            state: row.state,
            attempt: i64::from(row.attempt),
            max_attempts: i64::from(row.max_attempts),
            result_text: row.result_text,
            artifact_path: row.artifact_path,
            processing_ms: row.processing_ms,
            error_kind: row.error_kind,
            error_message: row.error_message,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        }
    }
}

fn decode(row: &PgRow) -> StoreResult<(Job, i64)> {
    let raw = PgJobRow::from_row(row).map_err(|e| map_sqlx_error("decode", e))?;
    JobRow::from(raw).into_job()
}

fn to_i32(value: u32, what: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Storage(format!("{what} {value} does not fit the schema")))
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `url` and ensure the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url).map_err(|e| map_sqlx_error("connect", e))?;
        Self::connect_with(options).await
    }

    pub async fn connect_with(options: PgConnectOptions) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> StoreResult<(Job, i64)> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?
            .ok_or(StoreError::NotFound(id))?;
        decode(&row)
    }

    async fn fetch_rows(&self, sql: &str, bind: Option<QueryBind<'_>>, limit: usize) -> StoreResult<Vec<Job>> {
        let mut query = sqlx::query(sql);
        query = match bind {
            Some(QueryBind::Text(s)) => query.bind(s),
            Some(QueryBind::Time(t)) => query.bind(t),
            None => query,
        };
        let rows = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        let span = Span::current();
        span.record("row_count", rows.len());

        rows.iter().map(|row| decode(row).map(|(job, _)| job)).collect()
    }

    async fn write_if_version(&self, next: &Job, version: i64) -> StoreResult<bool> {
        let cols = MutableColumns::of(next);
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = $1, attempt = $2,
                result_text = $3, artifact_path = $4, processing_ms = $5,
                error_kind = $6, error_message = $7,
                lease_owner = $8, lease_expires_at = $9,
                updated_at = $10, version = version + 1
            WHERE id = $11 AND version = $12
            "#,
        )
        .bind(cols.state)
        .bind(to_i32(next.attempt, "attempt")?)
        .bind(cols.result_text)
        .bind(cols.artifact_path)
        .bind(cols.processing_ms)
        .bind(cols.error_kind)
        .bind(cols.error_message)
        .bind(cols.lease_owner)
        .bind(cols.lease_expires_at)
        .bind(cols.updated_at)
        .bind(next.id.as_uuid())
        .bind(version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap<F>(&self, id: JobId, expected: JobState, decide: F) -> StoreResult<Job>
    where
        F: Fn(&Job) -> StoreResult<Job> + Send + Sync,
    {
        let mut last_state = expected;
        for _ in 0..MAX_CAS_ROUNDS {
            let (current, version) = self.fetch(id).await?;
            last_state = current.state;
            let next = decide(&current)?;
            if self.write_if_version(&next, version).await? {
                return Ok(next);
            }
            debug!(job_id = %id, version, "row changed during transition; re-evaluating");
        }
        Err(contention(id, expected, last_state))
    }
}

enum QueryBind<'a> {
    Text(&'a str),
    Time(DateTime<Utc>),
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(idempotency_key = ?new.idempotency_key), err)]
    async fn create(&self, new: NewJob) -> StoreResult<Created> {
        let job = Job::create(JobId::new(), new, store_now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, query, file_ref, idempotency_key, state, attempt, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.query)
        .bind(job.file_ref.as_str())
        .bind(job.idempotency_key.as_ref().map(|k| k.as_str()))
        .bind(job.state.as_str())
        .bind(to_i32(job.attempt, "attempt")?)
        .bind(to_i32(job.max_attempts, "max_attempts")?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(Created { job, existed: false });
        }

        let key = job
            .idempotency_key
            .as_ref()
            .ok_or_else(|| StoreError::Storage("insert ignored without an idempotency key".to_string()))?;
        let existing = self
            .find_by_idempotency_key(key)
            .await?
            .ok_or_else(|| StoreError::Storage(format!("idempotency key '{key}' vanished")))?;
        Ok(Created {
            job: existing,
            existed: true,
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> StoreResult<Job> {
        self.fetch(id).await.map(|(job, _)| job)
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;
        row.map(|row| decode(&row).map(|(job, _)| job)).transpose()
    }

    #[instrument(skip(self, patch), fields(job_id = %id, expected = %expected, to = %to))]
    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> StoreResult<Job> {
        self.compare_and_swap(id, expected, |current| {
            decide_transition(current, expected, to, patch.clone(), store_now())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id, worker = %owner))]
    async fn renew_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Job> {
        self.compare_and_swap(id, JobState::Running, |current| decide_renewal(current, owner, expires_at))
            .await
    }

    #[instrument(skip(self), fields(row_count))]
    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM jobs WHERE state = $1 ORDER BY seq ASC LIMIT $2"
                );
                self.fetch_rows(&sql, Some(QueryBind::Text(state.as_str())), usize::MAX)
                    .await
            }
            None => {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs ORDER BY seq ASC LIMIT $1");
                self.fetch_rows(&sql, None, usize::MAX).await
            }
        }
    }

    #[instrument(skip(self), fields(row_count))]
    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs \
             WHERE state = 'running' AND lease_expires_at < $1 ORDER BY seq ASC LIMIT $2"
        );
        self.fetch_rows(&sql, Some(QueryBind::Time(now)), limit).await
    }

    #[instrument(skip(self), fields(row_count))]
    async fn stale_pending(&self, updated_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs \
             WHERE state = 'pending' AND updated_at < $1 ORDER BY seq ASC LIMIT $2"
        );
        self.fetch_rows(&sql, Some(QueryBind::Time(updated_before)), limit)
            .await
    }

    async fn stats(&self) -> StoreResult<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let state: JobState = state
                .parse()
                .map_err(|_| StoreError::Storage(format!("unknown state '{state}' in jobs table")))?;
            stats.add(state, u64::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}
