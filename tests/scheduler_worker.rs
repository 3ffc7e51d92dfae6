mod common;

use chrono::Duration as ChronoDuration;
use common::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use escrow_engine::escrow::models::{EscrowStatus, PoolStatus};
use escrow_engine::settlement::{
    ReconciliationReporter, ReleaseJob, ReleaseQueue, ReleaseScheduler, ReleaseWorker,
    SchedulerConfig,
};
use escrow_engine::store::LedgerStore;

fn scheduler(h: &Harness, queue: ReleaseQueue) -> ReleaseScheduler {
    ReleaseScheduler::new(
        Arc::new(h.store.clone()),
        queue,
        SchedulerConfig {
            scan_interval: Duration::from_secs(300),
            grace_period: ChronoDuration::hours(GRACE_HOURS),
        },
    )
}

fn spawn_worker(h: &Harness, queue: ReleaseQueue, rx: tokio::sync::mpsc::UnboundedReceiver<ReleaseJob>, max_attempts: u32) -> tokio::task::JoinHandle<()> {
    let reporter = Arc::new(ReconciliationReporter::new(Arc::new(h.store.clone())));
    ReleaseWorker::new(
        h.processor.clone(),
        reporter,
        queue,
        rx,
        max_attempts,
        Duration::from_millis(0),
    )
    .start()
}

#[tokio::test]
async fn scan_enqueues_eligible_pools_once() {
    let h = harness();
    let (queue, _rx) = ReleaseQueue::new();

    let due = seed_releasable_pool(&h).await;
    h.service
        .record_contribution(due, Uuid::new_v4(), dec!(10000))
        .await
        .unwrap();

    // Deadline passed but grace still running: not a candidate.
    let early = seed_pool(
        &h,
        PoolStatus::Filled,
        chrono::Utc::now() - ChronoDuration::hours(1),
    )
    .await;
    h.service
        .record_contribution(early, Uuid::new_v4(), dec!(10000))
        .await
        .unwrap();

    // Pool never filled: not a candidate.
    let open = seed_pool(
        &h,
        PoolStatus::Open,
        chrono::Utc::now() - ChronoDuration::hours(72),
    )
    .await;
    h.service
        .record_contribution(open, Uuid::new_v4(), dec!(10000))
        .await
        .unwrap();

    let scheduler = scheduler(&h, queue);
    assert_eq!(scheduler.scan().await.unwrap(), 1);

    // The job is still pending, so a second scan dedupes it.
    assert_eq!(scheduler.scan().await.unwrap(), 0);
}

#[tokio::test]
async fn worker_drains_scheduled_jobs_to_completion() {
    let h = harness();
    let (queue, rx) = ReleaseQueue::new();

    let pool_id = seed_releasable_pool(&h).await;
    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(20000))
        .await
        .unwrap();

    let scheduler = scheduler(&h, queue.clone());
    assert_eq!(scheduler.scan().await.unwrap(), 1);

    let handle = spawn_worker(&h, queue.clone(), rx, 3);
    drop(queue);
    drop(scheduler);
    handle.await.unwrap();

    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Released);
    assert_eq!(h.transfers.calls(), 1);
    assert_eq!(h.store.pool_status(pool_id).await, Some(PoolStatus::Completed));
}

#[tokio::test]
async fn worker_retries_transfer_failures_within_budget() {
    let h = harness();
    let (queue, rx) = ReleaseQueue::new();

    let pool_id = seed_releasable_pool(&h).await;
    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(20000))
        .await
        .unwrap();

    // Two failures, then success on the third attempt.
    h.transfers.fail_next(2);
    assert!(queue.enqueue(ReleaseJob::scheduled(pool_id)));

    let handle = spawn_worker(&h, queue.clone(), rx, 3);
    drop(queue);
    handle.await.unwrap();

    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Released);
    assert_eq!(h.transfers.calls(), 1);
    assert!(h.store.alerts().await.is_empty());
}

#[tokio::test]
async fn exhausted_retry_budget_raises_an_alert() {
    let h = harness();
    let (queue, rx) = ReleaseQueue::new();

    let pool_id = seed_releasable_pool(&h).await;
    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(20000))
        .await
        .unwrap();

    h.transfers.fail_next(10);
    assert!(queue.enqueue(ReleaseJob::scheduled(pool_id)));

    let handle = spawn_worker(&h, queue.clone(), rx, 2);
    drop(queue);
    handle.await.unwrap();

    // Nothing paid out, escrow left retryable, operator alerted.
    assert_eq!(h.transfers.calls(), 0);
    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Failed);
    assert_eq!(entry.available(), dec!(20000));

    let alerts = h.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].pool_id, pool_id);
}

#[tokio::test]
async fn finalize_failure_persists_a_reconciliation_alert() {
    let h = harness();
    let (queue, rx) = ReleaseQueue::new();

    let pool_id = seed_releasable_pool(&h).await;
    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(40000))
        .await
        .unwrap();

    h.store.inject_finalize_failure().await;
    assert!(queue.enqueue(ReleaseJob::scheduled(pool_id)));

    let handle = spawn_worker(&h, queue.clone(), rx, 3);
    drop(queue);
    handle.await.unwrap();

    // The transfer went out exactly once and was never retried.
    assert_eq!(h.transfers.calls(), 1);

    let alerts = h.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].pool_id, pool_id);
    assert!(alerts[0].transfer_reference.is_some());
    assert!(alerts[0].message.contains("finalization failed"));
}
