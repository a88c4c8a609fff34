//! Lease reaper: crash recovery for jobs whose worker disappeared.
//!
//! - `Running` with an expired lease and attempts left → `Pending` + republish
//! - `Running` with an expired lease on the final attempt → `Failed{Transient}`
//! - `Pending` untouched for `stale_pending_after` → republished (lost publishes)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docflow_broker::Broker;
use docflow_core::{ErrorInfo, Job, JobId, JobPatch, JobState};

use super::store::{instant_before, JobStore, StoreError, StoreResult};

pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired on final attempt";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub stale_pending_after: Duration,
    /// Max jobs examined per query per sweep
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            stale_pending_after: Duration::from_secs(120),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub expired: usize,
    pub republished: usize,
}

pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    config: ReaperConfig,
    last_republish: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl std::fmt::Debug for LeaseReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseReaper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "reaper task ended abnormally");
        }
    }
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>, config: ReaperConfig) -> Self {
        Self {
            store,
            broker,
            config,
            last_republish: Mutex::new(HashMap::new()),
        }
    }

    /// Sweep every `config.interval` until shut down.
    pub fn spawn(self: Arc<Self>) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match self.sweep_once(Utc::now()).await {
                            Ok(report) if report != SweepReport::default() => {
                                info!(
                                    reclaimed = report.reclaimed,
                                    expired = report.expired,
                                    republished = report.republished,
                                    "reaper sweep"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "reaper sweep failed"),
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });
        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// One pass over expired leases and stale pending jobs, as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();

        for job in self.store.expired_leases(now, self.config.batch_size).await? {
            if job.attempts_remaining() {
                if self.revert(&job, now, JobState::Pending, JobPatch::reclaim(now)).await {
                    warn!(job_id = %job.id, attempt = job.attempt, "lease expired; job reclaimed");
                    self.publish(job.id).await;
                    report.reclaimed += 1;
                }
            } else {
                let patch = JobPatch::expire(now, ErrorInfo::transient(LEASE_EXPIRED_MESSAGE));
                if self.revert(&job, now, JobState::Failed, patch).await {
                    warn!(job_id = %job.id, attempt = job.attempt, "lease expired on final attempt; job failed");
                    report.expired += 1;
                }
            }
        }

        let cutoff = instant_before(now, self.config.stale_pending_after);
        let stale = self.store.stale_pending(cutoff, self.config.batch_size).await?;
        let due: Vec<JobId> = {
            let mut last = self
                .last_republish
                .lock()
                .map_err(|_| StoreError::Storage("reaper republish map poisoned".to_string()))?;
            last.retain(|id, _| stale.iter().any(|job| job.id == *id));
            let due: Vec<JobId> = stale
                .iter()
                .filter(|job| last.get(&job.id).is_none_or(|at| *at <= cutoff))
                .map(|job| job.id)
                .collect();
            for id in &due {
                last.insert(*id, now);
            }
            due
        };
        for id in due {
            debug!(job_id = %id, "republishing stale pending job");
            self.publish(id).await;
            report.republished += 1;
        }

        Ok(report)
    }

    async fn revert(&self, job: &Job, now: DateTime<Utc>, to: JobState, patch: JobPatch) -> bool {
        match self.store.transition(job.id, JobState::Running, to, patch).await {
            Ok(_) => true,
            Err(err) if err.is_conflict() => {
                debug!(job_id = %job.id, now = %now, "lease renewed or job finished meanwhile");
                false
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "reaper transition failed");
                false
            }
        }
    }

    async fn publish(&self, id: JobId) {
        if let Err(err) = self.broker.publish(id).await {
            error!(job_id = %id, error = %err, "republish failed; next sweep retries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use docflow_broker::InMemoryBroker;
    use docflow_core::{FailureKind, FileRef, NewJob, WorkerId};

    use crate::jobs::store::InMemoryJobStore;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
        reaper: LeaseReaper,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let broker = Arc::new(InMemoryBroker::new());
        let reaper = LeaseReaper::new(
            store.clone(),
            broker.clone(),
            ReaperConfig {
                stale_pending_after: Duration::from_secs(60),
                ..ReaperConfig::default()
            },
        );
        Fixture { store, broker, reaper }
    }

    async fn running_job(f: &Fixture, max_attempts: u32, lease_secs: i64) -> Job {
        let new = NewJob::new("Summarize", FileRef::new("a.pdf"), None, max_attempts).unwrap();
        let job = f.store.create(new).await.unwrap().job;
        f.store
            .transition(
                job.id,
                JobState::Pending,
                JobState::Running,
                JobPatch::claim(WorkerId::new("gone"), Utc::now() + ChronoDuration::seconds(lease_secs)),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_republished() {
        let f = fixture();
        let job = running_job(&f, 3, 30).await;

        let report = f.reaper.sweep_once(Utc::now() + ChronoDuration::seconds(31)).await.unwrap();

        assert_eq!(report.reclaimed, 1);
        let reclaimed = f.store.get(job.id).await.unwrap();
        assert_eq!((reclaimed.state, reclaimed.attempt), (JobState::Pending, 1));
        assert!(reclaimed.lease.is_none());
        assert_eq!(f.broker.ready_len(), 1);
    }

    #[tokio::test]
    async fn live_lease_is_left_alone() {
        let f = fixture();
        let job = running_job(&f, 3, 30).await;

        let report = f.reaper.sweep_once(Utc::now()).await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(f.store.get(job.id).await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn expired_final_attempt_fails_the_job() {
        let f = fixture();
        let job = running_job(&f, 1, 30).await;

        let report = f.reaper.sweep_once(Utc::now() + ChronoDuration::seconds(31)).await.unwrap();

        assert_eq!(report.expired, 1);
        let failed = f.store.get(job.id).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        let error = failed.error.unwrap();
        assert_eq!(error.kind, FailureKind::Transient);
        assert_eq!(error.message, LEASE_EXPIRED_MESSAGE);
        assert_eq!(f.broker.ready_len(), 0);
    }

    #[tokio::test]
    async fn stale_pending_is_republished_once_per_window() {
        let f = fixture();
        let new = NewJob::new("Summarize", FileRef::new("a.pdf"), None, 3).unwrap();
        let job = f.store.create(new).await.unwrap().job;

        let later = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(f.reaper.sweep_once(later).await.unwrap().republished, 1);
        assert_eq!(f.reaper.sweep_once(later + ChronoDuration::seconds(5)).await.unwrap().republished, 0);
        assert_eq!(f.reaper.sweep_once(later + ChronoDuration::seconds(61)).await.unwrap().republished, 1);

        let first = f.broker.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.job_id, job.id);
        assert_eq!(f.broker.ready_len(), 1);
    }

    #[tokio::test]
    async fn fresh_pending_is_not_republished() {
        let f = fixture();
        let new = NewJob::new("Summarize", FileRef::new("a.pdf"), None, 3).unwrap();
        f.store.create(new).await.unwrap();

        assert_eq!(f.reaper.sweep_once(Utc::now()).await.unwrap().republished, 0);
    }

    #[tokio::test]
    async fn spawned_reaper_stops_on_shutdown() {
        let f = fixture();
        let reaper = Arc::new(LeaseReaper::new(
            f.store.clone(),
            f.broker.clone(),
            ReaperConfig {
                interval: Duration::from_millis(10),
                ..ReaperConfig::default()
            },
        ));
        let handle = reaper.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
