//! Worker pool: consume job ids, claim, run the analysis, record the outcome.
//!
//! Every state change goes through the store's CAS `transition`, so duplicate
//! deliveries, external cancellation and lease reclamation all resolve to a
//! failed CAS that the worker treats as "someone else owns this now".

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use docflow_analysis::{AnalysisError, AnalysisRequest, Analyzer};
use docflow_broker::{Broker, BrokerError, Delivery};
use docflow_core::{AnalysisResult, ErrorInfo, Job, JobId, JobPatch, JobState, WorkerId};

use super::store::{instant_after, JobStore, StoreError};
use super::retry::RetryPolicy;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops
    pub workers: usize,
    /// Prefix of generated worker ids
    pub name: String,
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
    /// Bound on a single analysis attempt
    pub execution_timeout: Duration,
    /// Bounded wait of one broker `consume`
    pub consume_wait: Duration,
    /// Pause before a requeued job is republished
    pub requeue_backoff: RetryPolicy,
    /// Local retries of store and broker calls
    pub io_retry: RetryPolicy,
    /// How long `shutdown` waits for in-flight attempts before aborting them
    pub drain_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            name: "worker".to_string(),
            lease_ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(20),
            execution_timeout: Duration::from_secs(30 * 60),
            consume_wait: Duration::from_secs(1),
            requeue_backoff: RetryPolicy::default(),
            io_retry: RetryPolicy::local_io(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the lease TTL and renews at a third of it.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self.renew_interval = ttl / 3;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    completed: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    duplicates_dropped: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub requeued: u64,
    pub failed: u64,
    pub duplicates_dropped: u64,
    pub abandoned: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Transient failure with attempts left; back to `Pending` and republished.
    Requeued,
    Failed,
    /// Job unknown or not `Pending`; the message was dropped.
    Duplicate,
    /// Result thrown away because the job was cancelled or reclaimed meanwhile.
    Discarded,
    /// Lease lost or unrenewable; the reaper recovers the job.
    Abandoned,
    /// Store unreachable before the claim; leave the message unacknowledged.
    Deferred,
}

impl Outcome {
    pub fn acks(&self) -> bool {
        !matches!(self, Outcome::Deferred)
    }
}

enum Attempt {
    Succeeded(AnalysisResult),
    Failed(AnalysisError),
    Abandoned(String),
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    workers: Vec<WorkerId>,
    stats: Arc<WorkerStats>,
    drain_timeout: Duration,
}

impl WorkerPoolHandle {
    /// Stop consuming and wait up to the drain timeout for in-flight attempts.
    ///
    /// Workers still busy at the deadline are aborted; their leases lapse and
    /// the reaper hands the jobs to another process. Returns `false` if any
    /// worker had to be aborted.
    pub async fn shutdown(self) -> bool {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + self.drain_timeout;
        let mut drained = true;
        for mut join in self.joins {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "worker task ended abnormally"),
                Err(_) => {
                    join.abort();
                    drained = false;
                }
            }
        }
        if !drained {
            warn!(timeout = ?self.drain_timeout, "drain timeout reached; aborted in-flight attempts");
        }
        drained
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Executes analysis jobs delivered by the broker.
#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerPoolConfig,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        analyzer: Arc<dyn Analyzer>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            broker,
            analyzer,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Start `config.workers` independent loops on the current runtime.
    pub fn spawn(&self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(self.config.workers);
        let mut workers = Vec::with_capacity(self.config.workers);

        for index in 0..self.config.workers {
            let worker = WorkerId::generate(&self.config.name, index);
            workers.push(worker.clone());
            let pool = self.clone();
            let shutdown = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { pool.run(worker, shutdown).await }));
        }
        info!(workers = workers.len(), "worker pool started");

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            workers,
            stats: Arc::clone(&self.stats),
            drain_timeout: self.config.drain_timeout,
        }
    }

    async fn run(&self, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %worker, "worker loop started");
        let mut broker_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let consumed = tokio::select! {
                _ = shutdown.changed() => break,
                consumed = self.broker.consume(self.config.consume_wait) => consumed,
            };

            match consumed {
                Ok(Some(delivery)) => {
                    broker_failures = 0;
                    let outcome = self.process(&worker, &delivery).await;
                    if outcome.acks() {
                        if let Err(err) = self.broker.ack(&delivery).await {
                            error!(worker = %worker, job_id = %delivery.job_id, error = %err, "ack failed");
                        }
                    }
                }
                Ok(None) => broker_failures = 0,
                Err(BrokerError::Closed) => break,
                Err(err) => {
                    broker_failures = broker_failures.saturating_add(1);
                    let delay = self.config.io_retry.delay_for_attempt(broker_failures);
                    error!(worker = %worker, error = %err, retry_in_ms = delay.as_millis() as u64, "consume failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(worker = %worker, "worker loop stopped");
    }

    /// Handle one delivery end to end. The caller acks when [`Outcome::acks`].
    pub async fn process(&self, worker: &WorkerId, delivery: &Delivery) -> Outcome {
        let id = delivery.job_id;

        let job = match self.store.get(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!(worker = %worker, job_id = %id, "delivery for unknown job dropped");
                return self.duplicate();
            }
            Err(err) => {
                error!(worker = %worker, job_id = %id, error = %err, "store unavailable; delivery deferred");
                return Outcome::Deferred;
            }
        };
        if job.state != JobState::Pending {
            debug!(worker = %worker, job_id = %id, state = %job.state, redelivered = delivery.redelivered, "job not pending; delivery dropped");
            return self.duplicate();
        }

        let expires_at = instant_after(Utc::now(), self.config.lease_ttl);
        let claimed = match self
            .store
            .transition(id, JobState::Pending, JobState::Running, JobPatch::claim(worker.clone(), expires_at))
            .await
        {
            Ok(job) => job,
            Err(StoreError::Storage(msg)) => {
                error!(worker = %worker, job_id = %id, error = %msg, "claim failed; delivery deferred");
                return Outcome::Deferred;
            }
            Err(err) => {
                debug!(worker = %worker, job_id = %id, error = %err, "claim lost");
                return self.duplicate();
            }
        };
        WorkerStats::bump(&self.stats.claimed);
        info!(worker = %worker, job_id = %id, attempt = claimed.attempt, "job claimed");

        let attempt = self.run_attempt(worker, &claimed).await;
        self.finish(worker, &claimed, attempt).await
    }

    fn duplicate(&self) -> Outcome {
        WorkerStats::bump(&self.stats.duplicates_dropped);
        Outcome::Duplicate
    }

    /// Run the analysis in its own task while keeping the lease alive.
    async fn run_attempt(&self, worker: &WorkerId, job: &Job) -> Attempt {
        let request = AnalysisRequest {
            job_id: job.id,
            file_ref: job.file_ref.clone(),
            query: job.query.clone(),
            attempt: job.attempt,
        };
        let analyzer = Arc::clone(&self.analyzer);
        let mut task = tokio::spawn(async move { analyzer.analyze(&request).await });

        let ttl = self.config.lease_ttl;
        let deadline = Instant::now() + self.config.execution_timeout;
        let mut lease_deadline = Instant::now() + ttl;
        let period = self.config.renew_interval.max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(result)) => Attempt::Succeeded(result),
                        Ok(Err(err)) => Attempt::Failed(err),
                        Err(err) => Attempt::Failed(AnalysisError::retryable(format!("analysis task failed: {err}"))),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    task.abort();
                    return Attempt::Failed(AnalysisError::retryable(format!(
                        "execution timed out after {}s",
                        self.config.execution_timeout.as_secs_f64()
                    )));
                }
                _ = renew.tick() => {
                    let renewed_at = Instant::now();
                    match self.store.renew_lease(job.id, worker, instant_after(Utc::now(), ttl)).await {
                        Ok(_) => lease_deadline = renewed_at + ttl,
                        Err(StoreError::Storage(msg)) => {
                            if Instant::now() >= lease_deadline {
                                task.abort();
                                return Attempt::Abandoned(format!("lease could not be renewed: {msg}"));
                            }
                            warn!(worker = %worker, job_id = %job.id, error = %msg, "lease renewal failed");
                        }
                        Err(err) => {
                            task.abort();
                            return Attempt::Abandoned(err.to_string());
                        }
                    }
                }
            }
        }
    }

    async fn finish(&self, worker: &WorkerId, job: &Job, attempt: Attempt) -> Outcome {
        match attempt {
            Attempt::Succeeded(result) => {
                let processing_ms = result.processing_ms;
                match self
                    .write_final(worker, job.id, JobState::Completed, JobPatch::complete(worker.clone(), result))
                    .await
                {
                    Some(done) => {
                        WorkerStats::bump(&self.stats.completed);
                        info!(worker = %worker, job_id = %job.id, attempt = done.attempt, processing_ms, "job completed");
                        Outcome::Completed
                    }
                    None => Outcome::Discarded,
                }
            }
            Attempt::Failed(err) if err.is_retryable() && job.attempts_remaining() => {
                let Some(pending) = self
                    .write_final(worker, job.id, JobState::Pending, JobPatch::requeue(worker.clone()))
                    .await
                else {
                    return Outcome::Discarded;
                };
                WorkerStats::bump(&self.stats.requeued);
                let delay = self.config.requeue_backoff.delay_for_attempt(pending.attempt);
                warn!(
                    worker = %worker,
                    job_id = %job.id,
                    attempt = pending.attempt,
                    max_attempts = pending.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; job requeued"
                );
                self.republish_later(job.id, delay);
                Outcome::Requeued
            }
            Attempt::Failed(err) => {
                let error = if err.is_retryable() {
                    ErrorInfo::transient(err.message())
                } else {
                    ErrorInfo::permanent(err.message())
                };
                match self
                    .write_final(worker, job.id, JobState::Failed, JobPatch::fail(worker.clone(), error))
                    .await
                {
                    Some(failed) => {
                        WorkerStats::bump(&self.stats.failed);
                        warn!(worker = %worker, job_id = %job.id, attempt = failed.attempt, error = %err, "job failed");
                        Outcome::Failed
                    }
                    None => Outcome::Discarded,
                }
            }
            Attempt::Abandoned(reason) => {
                WorkerStats::bump(&self.stats.abandoned);
                warn!(worker = %worker, job_id = %job.id, reason = %reason, "attempt abandoned");
                Outcome::Abandoned
            }
        }
    }

    /// Final `Running → to` write fenced by our lease. `None` means the
    /// outcome was not recorded.
    async fn write_final(&self, worker: &WorkerId, id: JobId, to: JobState, patch: JobPatch) -> Option<Job> {
        let policy = &self.config.io_retry;
        let mut tries = 0u32;
        loop {
            tries += 1;
            match self.store.transition(id, JobState::Running, to, patch.clone()).await {
                Ok(job) => return Some(job),
                Err(StoreError::Storage(msg)) if policy.should_retry(tries) => {
                    let delay = policy.delay_for_attempt(tries);
                    warn!(worker = %worker, job_id = %id, to = %to, error = %msg, retry_in_ms = delay.as_millis() as u64, "final write failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::Storage(msg)) => {
                    error!(worker = %worker, job_id = %id, to = %to, error = %msg, "final write failed; leaving job to the reaper");
                    WorkerStats::bump(&self.stats.abandoned);
                    return None;
                }
                Err(err) => {
                    info!(worker = %worker, job_id = %id, to = %to, error = %err, "outcome discarded; job changed hands");
                    return None;
                }
            }
        }
    }

    fn republish_later(&self, id: JobId, delay: Duration) {
        let broker = Arc::clone(&self.broker);
        let policy = self.config.io_retry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut tries = 0u32;
            loop {
                tries += 1;
                match broker.publish(id).await {
                    Ok(()) => return,
                    Err(err) if policy.should_retry(tries) => {
                        warn!(job_id = %id, error = %err, "republish failed; retrying");
                        tokio::time::sleep(policy.delay_for_attempt(tries)).await;
                    }
                    Err(err) => {
                        error!(job_id = %id, error = %err, "republish failed; stale-pending sweep will recover it");
                        return;
                    }
                }
            }
        });
    }
}
