use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispute::DisputeSource;
use crate::error::{AppError, AppResult};
use crate::escrow::models::{commission_split, EscrowEntry};
use crate::notify::{NotificationKind, NotificationSink};
use crate::store::{LedgerStore, PoolSource};
use crate::transfer::TransferProvider;

/// What asked for the release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReleaseTrigger {
    Scheduled,
    Admin,
    DisputeResolution,
}

impl ReleaseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseTrigger::Scheduled => "scheduled",
            ReleaseTrigger::Admin => "admin",
            ReleaseTrigger::DisputeResolution => "dispute_resolution",
        }
    }
}

/// Preconditions that end a release attempt without touching the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    InvalidPoolState,
    OpenDisputes,
    GracePeriodNotEnded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InvalidPoolState => "invalid_pool_state",
            SkipReason::OpenDisputes => "open_disputes",
            SkipReason::GracePeriodNotEnded => "grace_period_not_ended",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReceipt {
    pub pool_id: Uuid,

    #[serde(with = "rust_decimal::serde::float")]
    pub gross: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub commission: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub net: Decimal,

    pub transfer_code: String,
    pub transfer_reference: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum ReleaseOutcome {
    Released(ReleaseReceipt),
    Skipped(SkipReason),
}

/// The release state machine: `Held/Releasable/Failed -> Processing ->
/// Released | Failed`.
///
/// Step A (the conditional claim) is the only concurrency control; once it
/// succeeds this execution owns the escrow. Step B is the irreversible
/// external side effect. Step C finalizes the ledger; a failure there after B
/// succeeded is never retried and escalates for manual reconciliation.
pub struct ReleaseProcessor {
    store: Arc<dyn LedgerStore>,
    pools: Arc<dyn PoolSource>,
    disputes: Arc<dyn DisputeSource>,
    transfers: Arc<dyn TransferProvider>,
    notifier: Arc<dyn NotificationSink>,
    commission_rate: Decimal,
    grace_period: Duration,
}

impl ReleaseProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        pools: Arc<dyn PoolSource>,
        disputes: Arc<dyn DisputeSource>,
        transfers: Arc<dyn TransferProvider>,
        notifier: Arc<dyn NotificationSink>,
        commission_rate: Decimal,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            pools,
            disputes,
            transfers,
            notifier,
            commission_rate,
            grace_period,
        }
    }

    /// Attempt to release a pool's escrow to the vendor.
    ///
    /// `force` bypasses only the open-disputes check; it is an audited admin
    /// path and every balance invariant still applies.
    pub async fn request_release(
        &self,
        pool_id: Uuid,
        trigger: ReleaseTrigger,
        reason: &str,
        force: bool,
    ) -> AppResult<ReleaseOutcome> {
        let pool = self
            .pools
            .pool(pool_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("pool {}", pool_id)))?;

        if !pool.accepts_release() {
            return Ok(ReleaseOutcome::Skipped(SkipReason::InvalidPoolState));
        }

        let snapshot = self.disputes.active_snapshot(pool_id).await?;
        if snapshot.has_active() {
            if force {
                warn!(
                    %pool_id,
                    trigger = trigger.as_str(),
                    active_disputes = snapshot.active_disputes,
                    reason,
                    "FORCED release past open disputes"
                );
            } else {
                return Ok(ReleaseOutcome::Skipped(SkipReason::OpenDisputes));
            }
        }

        if Utc::now() < pool.delivery_deadline + self.grace_period {
            return Ok(ReleaseOutcome::Skipped(SkipReason::GracePeriodNotEnded));
        }

        let entry = self
            .store
            .entry(pool_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;
        if entry.available() <= Decimal::ZERO {
            return Err(AppError::Conflict("no amount available".to_string()));
        }

        // Step A: claim. Exactly one concurrent execution gets past this.
        let reference = format!("rel_{}", Uuid::new_v4().simple());
        let entry = self.store.claim_for_release(pool_id, &reference).await?;

        let gross = entry.available();
        let (commission, net) = commission_split(gross, self.commission_rate);

        info!(
            %pool_id,
            trigger = trigger.as_str(),
            %gross,
            %commission,
            %net,
            reference,
            "escrow claimed, initiating transfer"
        );

        // Step B: the external transfer. On failure the claim is reverted
        // before the error surfaces; no funds have moved and the job may
        // retry.
        let narrative = format!("Pool {} vendor settlement", pool_id);
        let receipt = match self
            .transfers
            .initiate_transfer(net, &pool.payout_recipient, &narrative, &reference)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Err(revert_err) = self.store.release_failed(pool_id).await {
                    error!(%pool_id, %revert_err, "failed to revert claimed escrow after transfer failure");
                }
                self.notify_vendor(
                    pool.vendor_id,
                    NotificationKind::ReleaseFailed,
                    serde_json::json!({ "pool_id": pool_id, "error": e.to_string() }),
                )
                .await;
                return Err(AppError::ExternalService(format!(
                    "transfer failed for pool {}: {}",
                    pool_id, e
                )));
            }
        };

        // Step C: finalize. Past this point the money is out the door; a
        // failure must not be retried (a retry would risk a second transfer)
        // and becomes an operator problem.
        if let Err(e) = self
            .store
            .finalize_release(pool_id, gross, commission, net, &receipt.transfer_code)
            .await
        {
            error!(
                %pool_id,
                transfer_code = %receipt.transfer_code,
                reference,
                %net,
                "CRITICAL: transfer succeeded but ledger finalization failed"
            );
            return Err(AppError::Reconciliation {
                pool_id,
                transfer_reference: Some(reference),
                message: format!(
                    "transfer {} for {} succeeded but finalization failed: {}",
                    receipt.transfer_code, net, e
                ),
            });
        }

        self.notify_vendor(
            pool.vendor_id,
            NotificationKind::ReleaseCompleted,
            serde_json::json!({
                "pool_id": pool_id,
                "net": net.to_string(),
                "commission": commission.to_string(),
                "transfer_code": receipt.transfer_code,
            }),
        )
        .await;

        info!(%pool_id, transfer_code = %receipt.transfer_code, "escrow released");

        Ok(ReleaseOutcome::Released(ReleaseReceipt {
            pool_id,
            gross,
            commission,
            net,
            transfer_code: receipt.transfer_code,
            transfer_reference: reference,
        }))
    }

    /// Refund part of the escrow to specific buyers, typically as a dispute
    /// resolution. The transfer back to the buyers is effected by the calling
    /// administrative process; here only the ledger moves.
    pub async fn partial_release(
        &self,
        pool_id: Uuid,
        release_map: &HashMap<Uuid, Decimal>,
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        if release_map.is_empty() {
            return Err(AppError::Validation("release map is empty".to_string()));
        }
        if release_map.values().any(|amount| *amount <= Decimal::ZERO) {
            return Err(AppError::Validation(
                "release amounts must be positive".to_string(),
            ));
        }

        let releases: Vec<(Uuid, Decimal)> =
            release_map.iter().map(|(b, a)| (*b, *a)).collect();
        let entry = self
            .store
            .record_partial_release(pool_id, &releases, reason)
            .await?;

        info!(%pool_id, buyers = releases.len(), reason, "partial release recorded");
        Ok(entry)
    }

    /// Record an admin-effected vendor payout without driving a transfer.
    pub async fn manual_release(
        &self,
        pool_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(
                "release amount must be positive".to_string(),
            ));
        }

        let entry = self
            .store
            .record_manual_release(pool_id, amount, reason)
            .await?;

        info!(%pool_id, %amount, reason, "manual release recorded");
        Ok(entry)
    }

    async fn notify_vendor(
        &self,
        vendor_id: Uuid,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) {
        // Fire and forget: a notification failure never rolls back the ledger.
        if let Err(e) = self.notifier.notify(vendor_id, kind, payload).await {
            warn!(%vendor_id, kind = kind.as_str(), %e, "notification delivery failed");
        }
    }
}
