mod common;

use chrono::{Duration, Utc};
use common::*;
use futures::future::join_all;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use uuid::Uuid;

use escrow_engine::error::AppError;
use escrow_engine::escrow::models::{EscrowStatus, PoolStatus, TransactionKind};
use escrow_engine::settlement::{ReleaseOutcome, ReleaseTrigger, SkipReason};
use escrow_engine::store::LedgerStore;

#[tokio::test]
async fn full_release_pays_vendor_minus_commission() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(100000))
        .await
        .unwrap();

    let outcome = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Scheduled, "grace period elapsed", false)
        .await
        .unwrap();

    let receipt = match outcome {
        ReleaseOutcome::Released(r) => r,
        other => panic!("expected release, got {:?}", other),
    };
    assert_eq!(receipt.gross, dec!(100000));
    assert_eq!(receipt.commission, dec!(5000));
    assert_eq!(receipt.net, dec!(95000));
    assert_eq!(receipt.commission + receipt.net, receipt.gross);

    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Released);
    assert_eq!(entry.released_amount, dec!(100000));
    assert_eq!(entry.available(), dec!(0));

    // Exactly one EscrowRelease audit row, carrying net and commission.
    let releases: Vec<_> = h
        .store
        .transactions(pool_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::EscrowRelease)
        .collect();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].amount, dec!(95000));
    assert_eq!(releases[0].fees, dec!(5000));
    assert_eq!(
        releases[0].external_ref.as_deref(),
        Some(receipt.transfer_code.as_str())
    );

    // Pool completed, one external transfer.
    assert_eq!(
        h.store.pool_status(pool_id).await,
        Some(PoolStatus::Completed)
    );
    assert_eq!(h.transfers.calls(), 1);
}

#[tokio::test]
async fn release_preconditions_skip_without_touching_ledger() {
    let h = harness();

    // Pool not yet filled.
    let open_pool = seed_pool(&h, PoolStatus::Open, Utc::now() - Duration::hours(72)).await;
    h.service
        .record_contribution(open_pool, Uuid::new_v4(), dec!(5000))
        .await
        .unwrap();
    let outcome = h
        .processor
        .request_release(open_pool, ReleaseTrigger::Scheduled, "scan", false)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReleaseOutcome::Skipped(SkipReason::InvalidPoolState)
    ));

    // Grace period still running.
    let early_pool = seed_pool(&h, PoolStatus::Filled, Utc::now() - Duration::hours(1)).await;
    h.service
        .record_contribution(early_pool, Uuid::new_v4(), dec!(5000))
        .await
        .unwrap();
    let outcome = h
        .processor
        .request_release(early_pool, ReleaseTrigger::Scheduled, "scan", false)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReleaseOutcome::Skipped(SkipReason::GracePeriodNotEnded)
    ));

    // Nothing was claimed or transferred.
    assert_eq!(h.transfers.calls(), 0);
    let entry = h.store.entry(open_pool).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Held);
}

#[tokio::test]
async fn open_disputes_block_release_unless_forced() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;
    let buyer = Uuid::new_v4();

    h.service
        .record_contribution(pool_id, buyer, dec!(20000))
        .await
        .unwrap();
    h.disputes
        .set(escrow_engine::dispute::DisputeSnapshot {
            pool_id,
            subscriber_count: 1,
            active_disputes: 1,
            disputant_contributions: [(buyer, dec!(20000))].into_iter().collect(),
        })
        .await;

    let outcome = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Scheduled, "scan", false)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReleaseOutcome::Skipped(SkipReason::OpenDisputes)
    ));
    assert_eq!(h.transfers.calls(), 0);

    // The audited admin path pushes past the dispute check.
    let outcome = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Admin, "vendor cleared manually", true)
        .await
        .unwrap();
    assert!(matches!(outcome, ReleaseOutcome::Released(_)));
    assert_eq!(h.transfers.calls(), 1);
}

#[tokio::test]
async fn fully_withheld_escrow_conflicts_with_no_amount_available() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(15000))
        .await
        .unwrap();
    h.store
        .apply_hold(pool_id, dec!(15000), "all disputed")
        .await
        .unwrap();

    let err = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Scheduled, "scan", false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.transfers.calls(), 0);
}

#[tokio::test]
async fn concurrent_release_requests_pay_exactly_once() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(50000))
        .await
        .unwrap();

    // A retried queue job and a manual admin trigger racing.
    let mut tasks = Vec::new();
    for trigger in [ReleaseTrigger::Scheduled, ReleaseTrigger::Admin] {
        let processor = h.processor.clone();
        tasks.push(tokio::spawn(async move {
            processor
                .request_release(pool_id, trigger, "race", false)
                .await
        }));
    }

    let mut released = 0;
    for result in join_all(tasks).await {
        match result.expect("task panicked") {
            Ok(ReleaseOutcome::Released(_)) => released += 1,
            // The loser either fails the conditional claim or, if it ran
            // entirely after the winner, sees the already-completed pool.
            Err(AppError::Conflict(_)) => {}
            Ok(ReleaseOutcome::Skipped(SkipReason::InvalidPoolState)) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(released, 1);
    assert_eq!(h.transfers.calls(), 1);

    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.released_amount, dec!(50000));
}

#[tokio::test]
async fn transfer_failure_leaves_a_retryable_escrow() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(30000))
        .await
        .unwrap();

    h.transfers.fail_next(1);
    let err = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Scheduled, "scan", false)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // No partial deduction: amounts are exactly as before the attempt.
    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Failed);
    assert_eq!(entry.released_amount, dec!(0));
    assert_eq!(entry.available(), dec!(30000));
    assert!(entry.transfer_reference.is_none());

    // Failed re-enters Processing on the retry and completes.
    let outcome = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Scheduled, "retry", false)
        .await
        .unwrap();
    assert!(matches!(outcome, ReleaseOutcome::Released(_)));
    assert_eq!(h.transfers.calls(), 1);
}

#[tokio::test]
async fn finalize_failure_surfaces_reconciliation_error() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(40000))
        .await
        .unwrap();

    h.store.inject_finalize_failure().await;
    let err = h
        .processor
        .request_release(pool_id, ReleaseTrigger::Scheduled, "scan", false)
        .await
        .unwrap_err();

    // Money left the platform; this must not look retryable.
    assert!(!err.is_retryable());
    match err {
        AppError::Reconciliation {
            pool_id: p,
            transfer_reference,
            ..
        } => {
            assert_eq!(p, pool_id);
            assert!(transfer_reference.is_some());
        }
        other => panic!("expected reconciliation error, got {}", other),
    }
    assert_eq!(h.transfers.calls(), 1);
}

#[tokio::test]
async fn mid_release_escrow_rejects_balance_mutations() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;
    let buyer = Uuid::new_v4();

    h.service
        .record_contribution(pool_id, buyer, dec!(100000))
        .await
        .unwrap();

    // The saga is between claim and finalize; its gross is already spoken for.
    h.store
        .claim_for_release(pool_id, "rel_inflight")
        .await
        .unwrap();

    let err = h
        .store
        .apply_hold(pool_id, dec!(100000), "late dispute")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = h
        .store
        .record_manual_release(pool_id, dec!(1000), "offline payout")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = h
        .store
        .record_partial_release(pool_id, &[(buyer, dec!(1000))], "refund")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // The in-flight release finalizes cleanly and the balance never went
    // negative.
    h.store
        .finalize_release(pool_id, dec!(100000), dec!(5000), dec!(95000), "TRF_inflight")
        .await
        .unwrap();
    let entry = h.store.entry(pool_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EscrowStatus::Released);
    assert_eq!(entry.withheld_amount, dec!(0));
    assert_eq!(entry.released_amount, dec!(100000));
    assert_eq!(entry.available(), dec!(0));

    // Released is terminal for holds too.
    let err = h
        .store
        .apply_hold(pool_id, dec!(1), "post-release dispute")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn partial_release_respects_buyer_contributions() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    h.service
        .record_contribution(pool_id, first, dec!(10000))
        .await
        .unwrap();
    h.service
        .record_contribution(pool_id, second, dec!(8000))
        .await
        .unwrap();

    // Refunding more than the buyer put in is rejected.
    let over: HashMap<_, _> = [(second, dec!(9000))].into_iter().collect();
    let err = h
        .processor
        .partial_release(pool_id, &over, "dispute resolved")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Their exact contribution is fine.
    let exact: HashMap<_, _> = [(second, dec!(8000))].into_iter().collect();
    let entry = h
        .processor
        .partial_release(pool_id, &exact, "dispute resolved")
        .await
        .unwrap();
    assert_eq!(entry.released_amount, dec!(8000));
    assert_eq!(entry.available(), dec!(10000));

    let refunds: Vec<_> = h
        .store
        .transactions(pool_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, dec!(8000));
    assert_eq!(refunds[0].user_id, Some(second));
}

#[tokio::test]
async fn manual_release_is_bounded_by_available_balance() {
    let h = harness();
    let pool_id = seed_releasable_pool(&h).await;

    h.service
        .record_contribution(pool_id, Uuid::new_v4(), dec!(12000))
        .await
        .unwrap();

    let entry = h
        .processor
        .manual_release(pool_id, dec!(7000), "payout already effected offline")
        .await
        .unwrap();
    assert_eq!(entry.released_amount, dec!(7000));

    let err = h
        .processor
        .manual_release(pool_id, dec!(6000), "second payout")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = h
        .processor
        .manual_release(pool_id, dec!(-5), "negative")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}
