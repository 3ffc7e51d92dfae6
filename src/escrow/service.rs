use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispute::{DisputeSource, HoldClass, HoldDecision, HoldPolicy};
use crate::error::{AppError, AppResult};
use crate::escrow::models::{commission_split, EscrowEntry, LedgerView};
use crate::notify::{NotificationKind, NotificationSink};
use crate::store::{LedgerStore, PoolSource};

/// Front door for contribution and hold operations on the escrow ledger.
pub struct EscrowService {
    store: Arc<dyn LedgerStore>,
    pools: Arc<dyn PoolSource>,
    disputes: Arc<dyn DisputeSource>,
    notifier: Arc<dyn NotificationSink>,
    policy: HoldPolicy,
    commission_rate: Decimal,
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        pools: Arc<dyn PoolSource>,
        disputes: Arc<dyn DisputeSource>,
        notifier: Arc<dyn NotificationSink>,
        policy: HoldPolicy,
        commission_rate: Decimal,
    ) -> Self {
        Self {
            store,
            pools,
            disputes,
            notifier,
            policy,
            commission_rate,
        }
    }

    /// Fold one confirmed buyer payment into the pool's escrow. The caller is
    /// responsible for invoking this exactly once per confirmed payment;
    /// payment finalization upstream is transactional and checked for prior
    /// completion.
    pub async fn record_contribution(
        &self,
        pool_id: Uuid,
        buyer_id: Uuid,
        amount: Decimal,
    ) -> AppResult<EscrowEntry> {
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(
                "contribution amount must be positive".to_string(),
            ));
        }

        self.pools
            .pool(pool_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("pool {}", pool_id)))?;

        let entry = self
            .store
            .record_contribution(pool_id, buyer_id, amount)
            .await?;

        info!(%pool_id, %buyer_id, %amount, total_held = %entry.total_held, "contribution recorded");
        Ok(entry)
    }

    /// Derive the hold the current dispute ratio calls for, without applying it.
    pub async fn compute_hold(&self, pool_id: Uuid, raised_by: Uuid) -> AppResult<HoldDecision> {
        let entry = self
            .store
            .entry(pool_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;
        let snapshot = self.disputes.active_snapshot(pool_id).await?;

        Ok(self.policy.decide(&entry, &snapshot, raised_by))
    }

    /// Compute and apply the dispute hold in one go. A `None` decision leaves
    /// the entry untouched.
    pub async fn apply_hold(
        &self,
        pool_id: Uuid,
        raised_by: Uuid,
    ) -> AppResult<(HoldDecision, EscrowEntry)> {
        let pool = self
            .pools
            .pool(pool_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("pool {}", pool_id)))?;

        let decision = self.compute_hold(pool_id, raised_by).await?;

        if decision.class == HoldClass::None || decision.amount == Decimal::ZERO {
            let entry = self
                .store
                .entry(pool_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;
            return Ok((decision, entry));
        }

        let reason = decision.reason.clone().unwrap_or_default();
        let entry = self
            .store
            .apply_hold(pool_id, decision.amount, &reason)
            .await?;

        info!(
            %pool_id,
            class = ?decision.class,
            amount = %decision.amount,
            "dispute hold applied"
        );

        // Fire and forget, same contract as the release notifications.
        let payload = serde_json::json!({
            "pool_id": pool_id,
            "class": decision.class,
            "amount": decision.amount.to_string(),
        });
        if let Err(e) = self
            .notifier
            .notify(pool.vendor_id, NotificationKind::HoldApplied, payload)
            .await
        {
            warn!(vendor_id = %pool.vendor_id, %e, "hold notification delivery failed");
        }

        Ok((decision, entry))
    }

    /// Full financial view of a pool: entry, per-buyer contributions, derived
    /// commission split, and the audit trail.
    pub async fn ledger(&self, pool_id: Uuid) -> AppResult<LedgerView> {
        let entry = self
            .store
            .entry(pool_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        let contributions = self.store.contributions(pool_id).await?;
        let transactions = self.store.transactions(pool_id).await?;

        let available = entry.available();
        let (commission, net_for_vendor) = commission_split(available, self.commission_rate);

        Ok(LedgerView {
            entry,
            contributions,
            available,
            commission,
            net_for_vendor,
            transactions,
        })
    }
}
