use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::collections::HashMap;
use uuid::Uuid;

/// Escrow lifecycle - `Released` is terminal, `Failed` is re-enterable into
/// `Processing` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "escrow_status", rename_all = "lowercase")]
pub enum EscrowStatus {
    Held,
    Releasable,
    Processing,
    Released,
    Failed,
}

impl EscrowStatus {
    /// Whether the balance columns may still move. `Processing` belongs to an
    /// in-flight release that already committed to its claimed gross, and
    /// `Released` is terminal; mutating either would break
    /// `total_held >= released_amount + withheld_amount`.
    pub fn allows_balance_mutation(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Held | EscrowStatus::Releasable | EscrowStatus::Failed
        )
    }
}

/// Pool status, owned by the pool collaborator. This engine only reads it and
/// writes the transition to `Completed` on full release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "pool_status", rename_all = "snake_case")]
pub enum PoolStatus {
    Open,
    Filled,
    InDelivery,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_kind", rename_all = "snake_case")]
pub enum TransactionKind {
    EscrowHold,
    EscrowRelease,
    Refund,
}

/// One escrow record per pool. Money only ever moves between the three amount
/// columns; `total_held >= released_amount + withheld_amount` at every
/// observable instant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowEntry {
    pub pool_id: Uuid,

    #[serde(with = "rust_decimal::serde::float")]
    pub total_held: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub released_amount: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub withheld_amount: Decimal,

    pub status: EscrowStatus,
    pub withheld_reason: Option<String>,
    /// External-transfer correlation id, set only while `Processing`.
    pub transfer_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowEntry {
    /// Amount releasable right now.
    pub fn available(&self) -> Decimal {
        self.total_held - self.released_amount - self.withheld_amount
    }

    pub fn has_available(&self, required: Decimal) -> bool {
        self.available() >= required
    }
}

/// Append-only audit row. Every money movement produces exactly one record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub pool_id: Uuid,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub fees: Decimal,

    pub kind: TransactionKind,
    pub external_ref: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The slice of the pool collaborator's state this engine reads.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pool {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub status: PoolStatus,
    pub delivery_deadline: DateTime<Utc>,
    /// Transfer-provider recipient code for the vendor's payout account.
    pub payout_recipient: String,
}

impl Pool {
    /// Release may only be attempted once the pool is filled or in delivery.
    pub fn accepts_release(&self) -> bool {
        matches!(self.status, PoolStatus::Filled | PoolStatus::InDelivery)
    }
}

/// Financial view of a pool returned to callers: entry plus the derived
/// commission split for the currently available balance.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerView {
    pub entry: EscrowEntry,
    pub contributions: HashMap<Uuid, Decimal>,

    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub commission: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub net_for_vendor: Decimal,

    pub transactions: Vec<LedgerTransaction>,
}

/// Operator alert raised when a saga outcome needs human action. This is the
/// only channel where financial discrepancies surface.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationAlert {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub transfer_reference: Option<String>,

    #[serde(with = "rust_decimal::serde::float")]
    pub total_held: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub released_amount: Decimal,

    #[serde(with = "rust_decimal::serde::float")]
    pub withheld_amount: Decimal,

    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Split an available balance into commission and vendor net. Derived rather
/// than rounded twice so `commission + net == available` holds exactly.
/// Midpoints round away from zero, half-up for positive money.
pub fn commission_split(available: Decimal, rate: Decimal) -> (Decimal, Decimal) {
    let commission =
        (available * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    (commission, available - commission)
}
