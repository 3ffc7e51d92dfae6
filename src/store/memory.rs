use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dispute::{DisputeSnapshot, DisputeSource};
use crate::error::{AppError, AppResult};
use crate::escrow::models::{
    EscrowEntry, EscrowStatus, LedgerTransaction, Pool, PoolStatus, ReconciliationAlert,
    TransactionKind,
};
use crate::store::{LedgerStore, PoolSource};

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, EscrowEntry>,
    contributions: HashMap<Uuid, HashMap<Uuid, Decimal>>,
    transactions: Vec<LedgerTransaction>,
    pools: HashMap<Uuid, Pool>,
    alerts: Vec<ReconciliationAlert>,
    fail_next_finalize: bool,
}

/// A thread-safe in-memory ledger store.
///
/// Implements the same atomic units of work as the Postgres store behind one
/// `RwLock`, so the saga and accumulator can be exercised without a database.
/// Used by the test suites and for local development.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pool(&self, pool: Pool) {
        self.state.write().await.pools.insert(pool.id, pool);
    }

    pub async fn pool_status(&self, pool_id: Uuid) -> Option<PoolStatus> {
        self.state.read().await.pools.get(&pool_id).map(|p| p.status)
    }

    pub async fn alerts(&self) -> Vec<ReconciliationAlert> {
        self.state.read().await.alerts.clone()
    }

    /// Make the next `finalize_release` fail after the point of no return,
    /// simulating a ledger write failure once the transfer already went out.
    pub async fn inject_finalize_failure(&self) {
        self.state.write().await.fail_next_finalize = true;
    }

    fn append_transaction(
        state: &mut State,
        user_id: Option<Uuid>,
        pool_id: Uuid,
        amount: Decimal,
        fees: Decimal,
        kind: TransactionKind,
        external_ref: Option<&str>,
        metadata: serde_json::Value,
    ) {
        state.transactions.push(LedgerTransaction {
            id: Uuid::new_v4(),
            user_id,
            pool_id,
            amount,
            fees,
            kind,
            external_ref: external_ref.map(str::to_string),
            metadata,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn entry(&self, pool_id: Uuid) -> AppResult<Option<EscrowEntry>> {
        Ok(self.state.read().await.entries.get(&pool_id).cloned())
    }

    async fn contributions(&self, pool_id: Uuid) -> AppResult<HashMap<Uuid, Decimal>> {
        Ok(self
            .state
            .read()
            .await
            .contributions
            .get(&pool_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_contribution(
        &self,
        pool_id: Uuid,
        buyer_id: Uuid,
        amount: Decimal,
    ) -> AppResult<EscrowEntry> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let entry = state.entries.entry(pool_id).or_insert_with(|| EscrowEntry {
            pool_id,
            total_held: Decimal::ZERO,
            released_amount: Decimal::ZERO,
            withheld_amount: Decimal::ZERO,
            status: EscrowStatus::Held,
            withheld_reason: None,
            transfer_reference: None,
            created_at: now,
            updated_at: now,
        });
        entry.total_held += amount;
        entry.updated_at = now;
        let snapshot = entry.clone();

        *state
            .contributions
            .entry(pool_id)
            .or_default()
            .entry(buyer_id)
            .or_insert(Decimal::ZERO) += amount;

        Self::append_transaction(
            &mut state,
            Some(buyer_id),
            pool_id,
            amount,
            Decimal::ZERO,
            TransactionKind::EscrowHold,
            None,
            serde_json::json!({ "buyer_id": buyer_id }),
        );

        Ok(snapshot)
    }

    async fn apply_hold(
        &self,
        pool_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(&pool_id)
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        if !entry.status.allows_balance_mutation() {
            return Err(AppError::Conflict(
                "already processing or released".to_string(),
            ));
        }
        if !entry.has_available(amount) {
            return Err(AppError::Conflict(
                "withhold exceeds available balance".to_string(),
            ));
        }

        entry.withheld_amount += amount;
        entry.withheld_reason = Some(reason.to_string());
        entry.updated_at = Utc::now();

        Ok(entry.clone())
    }

    async fn claim_for_release(
        &self,
        pool_id: Uuid,
        transfer_reference: &str,
    ) -> AppResult<EscrowEntry> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(&pool_id)
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        if !entry.status.allows_balance_mutation() {
            return Err(AppError::Conflict(
                "already processing or released".to_string(),
            ));
        }

        entry.status = EscrowStatus::Processing;
        entry.transfer_reference = Some(transfer_reference.to_string());
        entry.updated_at = Utc::now();

        Ok(entry.clone())
    }

    async fn release_failed(&self, pool_id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.entries.get_mut(&pool_id) {
            if entry.status == EscrowStatus::Processing {
                entry.status = EscrowStatus::Failed;
                entry.transfer_reference = None;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finalize_release(
        &self,
        pool_id: Uuid,
        gross: Decimal,
        commission: Decimal,
        net: Decimal,
        transfer_code: &str,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;

        if state.fail_next_finalize {
            state.fail_next_finalize = false;
            return Err(AppError::Internal(
                "injected finalize failure".to_string(),
            ));
        }

        let entry = state
            .entries
            .get_mut(&pool_id)
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        if entry.status != EscrowStatus::Processing {
            return Err(AppError::Conflict("escrow is not processing".to_string()));
        }

        entry.released_amount += gross;
        entry.status = EscrowStatus::Released;
        entry.updated_at = Utc::now();

        Self::append_transaction(
            &mut state,
            None,
            pool_id,
            net,
            commission,
            TransactionKind::EscrowRelease,
            Some(transfer_code),
            serde_json::json!({ "gross": gross.to_string() }),
        );

        if let Some(pool) = state.pools.get_mut(&pool_id) {
            pool.status = PoolStatus::Completed;
        }

        Ok(())
    }

    async fn record_partial_release(
        &self,
        pool_id: Uuid,
        releases: &[(Uuid, Decimal)],
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        let mut state = self.state.write().await;

        let contributions = state.contributions.get(&pool_id).cloned().unwrap_or_default();
        let entry = state
            .entries
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        if !entry.status.allows_balance_mutation() {
            return Err(AppError::Conflict(
                "already processing or released".to_string(),
            ));
        }

        let mut total = Decimal::ZERO;
        for (buyer_id, amount) in releases {
            let contributed = contributions.get(buyer_id).copied().unwrap_or(Decimal::ZERO);
            if *amount > contributed {
                return Err(AppError::Conflict(format!(
                    "release of {} exceeds buyer {} contribution of {}",
                    amount, buyer_id, contributed
                )));
            }
            total += *amount;
        }

        if !entry.has_available(total) {
            return Err(AppError::Conflict(format!(
                "release of {} exceeds available balance of {}",
                total,
                entry.available()
            )));
        }

        let entry = state
            .entries
            .get_mut(&pool_id)
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;
        entry.released_amount += total;
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();

        for (buyer_id, amount) in releases {
            Self::append_transaction(
                &mut state,
                Some(*buyer_id),
                pool_id,
                *amount,
                Decimal::ZERO,
                TransactionKind::Refund,
                None,
                serde_json::json!({ "reason": reason }),
            );
        }

        Ok(snapshot)
    }

    async fn record_manual_release(
        &self,
        pool_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(&pool_id)
            .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        if !entry.status.allows_balance_mutation() {
            return Err(AppError::Conflict(
                "already processing or released".to_string(),
            ));
        }
        if !entry.has_available(amount) {
            return Err(AppError::Conflict(
                "release exceeds available balance".to_string(),
            ));
        }

        entry.released_amount += amount;
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();

        Self::append_transaction(
            &mut state,
            None,
            pool_id,
            amount,
            Decimal::ZERO,
            TransactionKind::EscrowRelease,
            None,
            serde_json::json!({ "reason": reason, "manual": true }),
        );

        Ok(snapshot)
    }

    async fn transactions(&self, pool_id: Uuid) -> AppResult<Vec<LedgerTransaction>> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .iter()
            .filter(|t| t.pool_id == pool_id)
            .cloned()
            .collect())
    }

    async fn release_candidates(&self, deadline_cutoff: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    EscrowStatus::Held | EscrowStatus::Releasable | EscrowStatus::Failed
                ) && e.available() > Decimal::ZERO
            })
            .filter(|e| {
                state
                    .pools
                    .get(&e.pool_id)
                    .map(|p| p.accepts_release() && p.delivery_deadline <= deadline_cutoff)
                    .unwrap_or(false)
            })
            .map(|e| e.pool_id)
            .collect())
    }

    async fn record_alert(&self, alert: &ReconciliationAlert) -> AppResult<()> {
        self.state.write().await.alerts.push(alert.clone());
        Ok(())
    }
}

#[async_trait]
impl PoolSource for MemoryStore {
    async fn pool(&self, pool_id: Uuid) -> AppResult<Option<Pool>> {
        Ok(self.state.read().await.pools.get(&pool_id).cloned())
    }
}

/// Dispute source backed by a map of snapshots, settable from tests.
#[derive(Default, Clone)]
pub struct MemoryDisputeSource {
    snapshots: Arc<RwLock<HashMap<Uuid, DisputeSnapshot>>>,
}

impl MemoryDisputeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, snapshot: DisputeSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.pool_id, snapshot);
    }
}

#[async_trait]
impl DisputeSource for MemoryDisputeSource {
    async fn active_snapshot(&self, pool_id: Uuid) -> AppResult<DisputeSnapshot> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&pool_id)
            .cloned()
            .unwrap_or_else(|| DisputeSnapshot::quiet(pool_id)))
    }
}
