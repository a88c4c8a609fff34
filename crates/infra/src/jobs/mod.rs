//! Analysis job lifecycle.
//!
//! ## Components
//!
//! - `JobStore`: durable job records; CAS `transition` is the only mutation
//! - `WorkerPool`: consumes job ids, claims with a lease, runs the analysis
//! - `LeaseReaper`: returns jobs of vanished workers to the queue
//! - `SubmissionGateway`: validates and submits; cancel and manual retry
//! - `StatusReader`: read-only status/result views
//! - `JobEvents`: best-effort push of state changes

pub mod executor;
pub mod gateway;
pub mod notify;
pub mod postgres;
pub mod reader;
pub mod reaper;
pub mod retry;
pub mod sqlite;
pub mod store;

mod row;

#[cfg(test)]
mod contract;

pub use executor::{Outcome, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats, WorkerStatsSnapshot};
pub use gateway::{GatewayError, SubmissionGateway, Submission, Submitted};
pub use notify::{JobEvent, JobEvents, NotifyingJobStore};
pub use postgres::PostgresJobStore;
pub use reader::{JobResultView, JobStatusView, ReaderError, StatusReader};
pub use reaper::{LeaseReaper, ReaperConfig, ReaperHandle, SweepReport};
pub use sqlite::SqliteJobStore;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{Created, InMemoryJobStore, JobStats, JobStore, StoreError, StoreResult};
