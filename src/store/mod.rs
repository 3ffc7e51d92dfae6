pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::AppResult;
use crate::escrow::models::{EscrowEntry, LedgerTransaction, Pool, ReconciliationAlert};

pub use memory::{MemoryDisputeSource, MemoryStore};
pub use postgres::{PgDisputeSource, PgLedgerStore};

/// The ledger store - THE source of truth for escrow state.
///
/// Every mutation of a single escrow entry goes through either the
/// serializable-increment methods here or the conditional-transition method
/// (`claim_for_release`); nothing else in the system writes `status`,
/// `total_held`, `released_amount` or `withheld_amount`. Each method is one
/// atomic unit of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn entry(&self, pool_id: Uuid) -> AppResult<Option<EscrowEntry>>;

    async fn contributions(&self, pool_id: Uuid) -> AppResult<HashMap<Uuid, Decimal>>;

    /// Read-or-create the pool's entry, then atomically increment `total_held`
    /// and the buyer's cumulative contribution, appending one `EscrowHold`
    /// ledger row. Increments are commutative, so concurrent buyer payments
    /// need no ordering between them.
    async fn record_contribution(
        &self,
        pool_id: Uuid,
        buyer_id: Uuid,
        amount: Decimal,
    ) -> AppResult<EscrowEntry>;

    /// `withheld_amount += amount`, guarded by `amount <= available` and
    /// `status IN (Held, Releasable, Failed)`. An escrow that is mid-release
    /// has already committed its claimed gross to the transfer, so a hold
    /// against it fails with `Conflict` instead of driving the balance
    /// negative.
    async fn apply_hold(&self, pool_id: Uuid, amount: Decimal, reason: &str)
        -> AppResult<EscrowEntry>;

    /// Saga Step A: conditional transition to `Processing`, assigning the
    /// transfer reference, guarded by `status IN (Held, Releasable, Failed)`
    /// (`Failed` re-enters `Processing` on retry). The sole concurrency-control
    /// point for release; a second concurrent claim fails with
    /// `Conflict("already processing or released")`.
    async fn claim_for_release(
        &self,
        pool_id: Uuid,
        transfer_reference: &str,
    ) -> AppResult<EscrowEntry>;

    /// Revert a claimed entry to `Failed` and clear the transfer reference.
    /// Called only before any funds have moved, leaving the entry retryable.
    async fn release_failed(&self, pool_id: Uuid) -> AppResult<()>;

    /// Saga Step C, one transaction: `released_amount += gross`, status to
    /// `Released`, one `EscrowRelease` ledger row (amount = net, fees =
    /// commission), and the pool transitioned to `Completed`.
    async fn finalize_release(
        &self,
        pool_id: Uuid,
        gross: Decimal,
        commission: Decimal,
        net: Decimal,
        transfer_code: &str,
    ) -> AppResult<()>;

    /// Refund-style release of per-buyer amounts, each bounded by that buyer's
    /// contribution and the total by the available balance. One `Refund`
    /// ledger row per buyer. No external transfer is attempted here. Carries
    /// the same status guard as `apply_hold`.
    async fn record_partial_release(
        &self,
        pool_id: Uuid,
        releases: &[(Uuid, Decimal)],
        reason: &str,
    ) -> AppResult<EscrowEntry>;

    /// Admin-effected release: atomic `released_amount += amount` guarded by
    /// the available balance and the `apply_hold` status guard, plus one
    /// `EscrowRelease` ledger row.
    async fn record_manual_release(
        &self,
        pool_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> AppResult<EscrowEntry>;

    async fn transactions(&self, pool_id: Uuid) -> AppResult<Vec<LedgerTransaction>>;

    /// Pools whose escrow is still releasable, whose pool state admits
    /// release, and whose delivery deadline is at or before `deadline_cutoff`
    /// (i.e. the grace period has elapsed).
    async fn release_candidates(&self, deadline_cutoff: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    async fn record_alert(&self, alert: &ReconciliationAlert) -> AppResult<()>;
}

/// Read access to the pool collaborator's state.
#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn pool(&self, pool_id: Uuid) -> AppResult<Option<Pool>>;
}
