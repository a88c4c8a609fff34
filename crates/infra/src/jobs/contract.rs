//! Behaviour every [`JobStore`] implementation must show.
//!
//! Each check gets a fresh store from the factory.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use docflow_core::{
    AnalysisResult, ErrorInfo, FileRef, IdempotencyKey, JobId, JobPatch, JobState, NewJob, WorkerId,
};

use super::store::{JobStore, StoreError};

pub(crate) async fn run_all<F, Fut>(factory: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Arc<dyn JobStore>>,
{
    create_then_get(factory().await).await;
    unknown_id_is_not_found(factory().await).await;
    idempotency_key_returns_existing_job(factory().await).await;
    identical_requests_without_key_create_two_jobs(factory().await).await;
    claim_sets_lease_and_attempt(factory().await).await;
    stale_expected_state_conflicts_without_mutation(factory().await).await;
    lease_guard_fences_other_workers(factory().await).await;
    inconsistent_patch_is_rejected_without_mutation(factory().await).await;
    completed_is_absorbing(factory().await).await;
    renew_lease_requires_owner(factory().await).await;
    list_keeps_insertion_order_and_filters(factory().await).await;
    reaper_queries_find_expired_and_stale(factory().await).await;
    racing_claims_have_one_winner(factory().await).await;
    stats_count_states(factory().await).await;
}

fn new_job(query: &str) -> NewJob {
    NewJob::new(query, FileRef::new("sample.pdf"), None, 3).unwrap()
}

fn keyed_job(key: &str) -> NewJob {
    NewJob::new("Summarize", FileRef::new("sample.pdf"), Some(IdempotencyKey::new(key)), 3).unwrap()
}

fn worker(name: &str) -> WorkerId {
    WorkerId::new(name)
}

fn claim(name: &str) -> JobPatch {
    JobPatch::claim(worker(name), Utc::now() + Duration::seconds(60))
}

fn result() -> AnalysisResult {
    AnalysisResult {
        analysis_text: "healthy balance sheet".to_string(),
        artifact_path: "output/analysis.txt".to_string(),
        processing_ms: 42,
    }
}

async fn create_then_get(store: Arc<dyn JobStore>) {
    let created = store.create(new_job("Summarize")).await.unwrap();
    assert!(!created.existed);
    let job = created.job;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.lease.is_none() && job.result.is_none() && job.error.is_none());

    let fetched = store.get(job.id).await.unwrap();
    assert_eq!(fetched, job);
}

async fn unknown_id_is_not_found(store: Arc<dyn JobStore>) {
    let id = JobId::new();
    assert_eq!(store.get(id).await, Err(StoreError::NotFound(id)));
    let err = store
        .transition(id, JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::NotFound(id));
}

async fn idempotency_key_returns_existing_job(store: Arc<dyn JobStore>) {
    let first = store.create(keyed_job("req-1")).await.unwrap();
    let second = store.create(keyed_job("req-1")).await.unwrap();
    assert!(!first.existed);
    assert!(second.existed);
    assert_eq!(first.job.id, second.job.id);

    let found = store
        .find_by_idempotency_key(&IdempotencyKey::new("req-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.job.id);
    assert!(store
        .find_by_idempotency_key(&IdempotencyKey::new("other"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.list(None).await.unwrap().len(), 1);
}

async fn identical_requests_without_key_create_two_jobs(store: Arc<dyn JobStore>) {
    let a = store.create(new_job("Summarize")).await.unwrap();
    let b = store.create(new_job("Summarize")).await.unwrap();
    assert_ne!(a.job.id, b.job.id);
    assert_eq!(store.list(None).await.unwrap().len(), 2);
}

async fn claim_sets_lease_and_attempt(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;
    let running = store
        .transition(job.id, JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap();

    assert_eq!(running.state, JobState::Running);
    assert_eq!(running.attempt, 1);
    assert!(running.lease_held_by(&worker("w1")));
    assert!(running.updated_at >= job.updated_at);
    assert_eq!(store.get(job.id).await.unwrap(), running);
}

async fn stale_expected_state_conflicts_without_mutation(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;

    let err = store
        .transition(job.id, JobState::Running, JobState::Completed, JobPatch::complete(worker("w1"), result()))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::Conflict {
            id: job.id,
            expected: JobState::Running,
            actual: JobState::Pending,
        }
    );
    assert_eq!(store.get(job.id).await.unwrap(), job);
}

async fn lease_guard_fences_other_workers(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;
    let running = store
        .transition(job.id, JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap();

    let err = store
        .transition(job.id, JobState::Running, JobState::Completed, JobPatch::complete(worker("w2"), result()))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Lease not yet expired, so the reaper must not take it either.
    let err = store
        .transition(job.id, JobState::Running, JobState::Pending, JobPatch::reclaim(Utc::now()))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.get(job.id).await.unwrap(), running);

    let done = store
        .transition(job.id, JobState::Running, JobState::Completed, JobPatch::complete(worker("w1"), result()))
        .await
        .unwrap();
    assert_eq!(done.result, Some(result()));
    assert!(done.lease.is_none());
}

async fn inconsistent_patch_is_rejected_without_mutation(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;

    // Claim without a lease.
    let err = store
        .transition(job.id, JobState::Pending, JobState::Running, JobPatch::retry())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition(_)));

    // Not an edge at all.
    let err = store
        .transition(job.id, JobState::Pending, JobState::Completed, JobPatch::complete(worker("w1"), result()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition(_)));

    assert_eq!(store.get(job.id).await.unwrap(), job);
}

async fn completed_is_absorbing(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;
    store
        .transition(job.id, JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap();
    let done = store
        .transition(job.id, JobState::Running, JobState::Completed, JobPatch::complete(worker("w1"), result()))
        .await
        .unwrap();

    for expected in JobState::ALL {
        let err = store
            .transition(job.id, expected, JobState::Failed, JobPatch::cancel("late"))
            .await
            .unwrap_err();
        assert!(err.is_conflict() || matches!(err, StoreError::IllegalTransition(_)));
    }
    assert_eq!(store.get(job.id).await.unwrap(), done);
}

async fn renew_lease_requires_owner(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;

    let later = Utc::now() + Duration::seconds(600);
    assert!(store.renew_lease(job.id, &worker("w1"), later).await.unwrap_err().is_conflict());

    store
        .transition(job.id, JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap();
    let renewed = store.renew_lease(job.id, &worker("w1"), later).await.unwrap();
    let lease = renewed.lease.unwrap();
    assert_eq!(lease.expires_at.timestamp(), later.timestamp());
    assert!(store.renew_lease(job.id, &worker("w2"), later).await.unwrap_err().is_conflict());
}

async fn list_keeps_insertion_order_and_filters(store: Arc<dyn JobStore>) {
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(store.create(new_job(&format!("q{i}"))).await.unwrap().job.id);
    }
    store
        .transition(ids[2], JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap();

    let all: Vec<JobId> = store.list(None).await.unwrap().into_iter().map(|j| j.id).collect();
    assert_eq!(all, ids);

    let pending: Vec<JobId> = store
        .list(Some(JobState::Pending))
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(pending, vec![ids[0], ids[1], ids[3], ids[4]]);

    let running = store.list(Some(JobState::Running)).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, ids[2]);
}

async fn reaper_queries_find_expired_and_stale(store: Arc<dyn JobStore>) {
    let fresh = store.create(new_job("fresh")).await.unwrap().job;
    let expiring = store.create(new_job("expiring")).await.unwrap().job;
    let alive = store.create(new_job("alive")).await.unwrap().job;

    let past = Utc::now() - Duration::seconds(5);
    store
        .transition(expiring.id, JobState::Pending, JobState::Running, JobPatch::claim(worker("w1"), past))
        .await
        .unwrap();
    store
        .transition(alive.id, JobState::Pending, JobState::Running, claim("w2"))
        .await
        .unwrap();

    let expired = store.expired_leases(Utc::now(), 10).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, expiring.id);

    let stale = store
        .stale_pending(Utc::now() + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, fresh.id);
    assert!(store
        .stale_pending(fresh.updated_at - Duration::seconds(1), 10)
        .await
        .unwrap()
        .is_empty());

    // Reclaim only while the lease is still stale.
    let reclaimed = store
        .transition(expiring.id, JobState::Running, JobState::Pending, JobPatch::reclaim(Utc::now()))
        .await
        .unwrap();
    assert_eq!(reclaimed.state, JobState::Pending);
    assert!(reclaimed.lease.is_none());
    assert_eq!(reclaimed.attempt, 1);
}

async fn racing_claims_have_one_winner(store: Arc<dyn JobStore>) {
    let job = store.create(new_job("Summarize")).await.unwrap().job;

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .transition(job.id, JobState::Pending, JobState::Running, claim(&format!("w{i}")))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get(job.id).await.unwrap().attempt, 1);
}

async fn stats_count_states(store: Arc<dyn JobStore>) {
    let a = store.create(new_job("a")).await.unwrap().job;
    let b = store.create(new_job("b")).await.unwrap().job;
    store.create(new_job("c")).await.unwrap();

    store
        .transition(a.id, JobState::Pending, JobState::Running, claim("w1"))
        .await
        .unwrap();
    store
        .transition(b.id, JobState::Pending, JobState::Running, claim("w2"))
        .await
        .unwrap();
    store
        .transition(b.id, JobState::Running, JobState::Failed, JobPatch::fail(worker("w2"), ErrorInfo::permanent("bad pdf")))
        .await
        .unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.total(), 3);
}
