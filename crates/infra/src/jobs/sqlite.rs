//! SQLite-backed job store.
//!
//! Timestamps are stored as Unix milliseconds. Every write bumps `version`;
//! transitions read the row, decide, then `UPDATE ... WHERE id = ? AND version = ?`,
//! so a row changed in between is re-evaluated instead of overwritten.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, instrument};

use docflow_core::{IdempotencyKey, Job, JobId, JobPatch, JobState, NewJob, WorkerId};

use super::row::{map_sqlx_error, JobRow, MutableColumns, MAX_CAS_ROUNDS};
use super::store::{
    contention, decide_renewal, decide_transition, store_now, Created, JobStats, JobStore, StoreError, StoreResult,
};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT    NOT NULL UNIQUE,
        query            TEXT    NOT NULL,
        file_ref         TEXT    NOT NULL,
        idempotency_key  TEXT    UNIQUE,
        state            TEXT    NOT NULL,
        attempt          INTEGER NOT NULL,
        max_attempts     INTEGER NOT NULL,
        result_text      TEXT,
        artifact_path    TEXT,
        processing_ms    INTEGER,
        error_kind       TEXT,
        error_message    TEXT,
        lease_owner      TEXT,
        lease_expires_at INTEGER,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        version          INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_state_lease_idx ON jobs (state, lease_expires_at)",
    "CREATE INDEX IF NOT EXISTS jobs_state_updated_idx ON jobs (state, updated_at)",
];

const SELECT_COLUMNS: &str = "id, query, file_ref, idempotency_key, state, attempt, max_attempts, \
     result_text, artifact_path, processing_ms, error_kind, error_message, \
     lease_owner, lease_expires_at, created_at, updated_at, version";

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and ensure the schema.
    ///
    /// In-memory databases are per connection, so they get a single-connection pool.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
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
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> StoreResult<(Job, i64)> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?
            .ok_or(StoreError::NotFound(id))?;
        decode(&row)?.into_job()
    }

    async fn fetch_where(&self, clause: &str, binds: &[SqlValue<'_>], limit: usize) -> StoreResult<Vec<Job>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs {clause} ORDER BY seq ASC LIMIT ?");
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = match bind {
                SqlValue::Text(s) => query.bind(*s),
                SqlValue::Int(i) => query.bind(*i),
            };
        }
        let rows = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter()
            .map(|row| decode(row)?.into_job().map(|(job, _)| job))
            .collect()
    }

    /// Write the mutable columns of `next` if the row is still at `version`.
    async fn write_if_version(&self, next: &Job, version: i64) -> StoreResult<bool> {
        let cols = MutableColumns::of(next);
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?, attempt = ?,
                result_text = ?, artifact_path = ?, processing_ms = ?,
                error_kind = ?, error_message = ?,
                lease_owner = ?, lease_expires_at = ?,
                updated_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(cols.state)
        .bind(cols.attempt)
        .bind(cols.result_text)
        .bind(cols.artifact_path)
        .bind(cols.processing_ms)
        .bind(cols.error_kind)
        .bind(cols.error_message)
        .bind(cols.lease_owner)
        .bind(cols.lease_expires_at.map(|t| t.timestamp_millis()))
        .bind(cols.updated_at.timestamp_millis())
        .bind(next.id.to_string())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("write", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Read, decide, conditionally write; re-read when another writer got in first.
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

enum SqlValue<'a> {
    Text(&'a str),
    Int(i64),
}

fn millis(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let ms: i64 = row.try_get(column)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("timestamp {ms} out of range").into(),
    })
}

fn decode(row: &SqliteRow) -> StoreResult<JobRow> {
    let inner = || -> Result<JobRow, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let id = JobId::from_str(&id).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".to_string(),
            source: Box::new(e),
        })?;
        let lease_expires_at = match row.try_get::<Option<i64>, _>("lease_expires_at")? {
            Some(_) => Some(millis(row, "lease_expires_at")?),
            None => None,
        };
        Ok(JobRow {
            id,
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
            lease_expires_at,
            created_at: millis(row, "created_at")?,
            updated_at: millis(row, "updated_at")?,
            version: row.try_get("version")?,
        })
    };
    inner().map_err(|e| map_sqlx_error("decode", e))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, new), fields(idempotency_key = ?new.idempotency_key), err)]
    async fn create(&self, new: NewJob) -> StoreResult<Created> {
        let job = Job::create(JobId::new(), new, store_now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, query, file_ref, idempotency_key, state, attempt, max_attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.query)
        .bind(job.file_ref.as_str())
        .bind(job.idempotency_key.as_ref().map(|k| k.as_str()))
        .bind(job.state.as_str())
        .bind(i64::from(job.attempt))
        .bind(i64::from(job.max_attempts))
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(Created { job, existed: false });
        }

        // Lost the race for the idempotency key: hand back the winner.
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
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE idempotency_key = ?");
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;
        match row {
            Some(row) => Ok(Some(decode(&row)?.into_job()?.0)),
            None => Ok(None),
        }
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

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        match state {
            Some(state) => {
                self.fetch_where("WHERE state = ?", &[SqlValue::Text(state.as_str())], usize::MAX)
                    .await
            }
            None => self.fetch_where("", &[], usize::MAX).await,
        }
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.fetch_where(
            "WHERE state = 'running' AND lease_expires_at < ?",
            &[SqlValue::Int(now.timestamp_millis())],
            limit,
        )
        .await
    }

    async fn stale_pending(&self, updated_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.fetch_where(
            "WHERE state = 'pending' AND updated_at < ?",
            &[SqlValue::Int(updated_before.timestamp_millis())],
            limit,
        )
        .await
    }

    async fn stats(&self) -> StoreResult<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::jobs::contract;

    #[tokio::test]
    async fn sqlite_store_honours_the_contract() {
        contract::run_all(|| async {
            Arc::new(SqliteJobStore::connect("sqlite::memory:").await.unwrap()) as Arc<dyn JobStore>
        })
        .await;
    }

    #[tokio::test]
    async fn jobs_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());

        let id = {
            let store = SqliteJobStore::connect(&url).await.unwrap();
            let new = NewJob::new("Summarize", docflow_core::FileRef::new("a.pdf"), None, 3).unwrap();
            store.create(new).await.unwrap().job.id
        };

        let reopened = SqliteJobStore::connect(&url).await.unwrap();
        let job = reopened.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.query, "Summarize");
    }
}
