use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::dispute::{DisputeSnapshot, DisputeSource};
use crate::error::{AppError, AppResult};
use crate::escrow::models::{
    EscrowEntry, EscrowStatus, LedgerTransaction, Pool, ReconciliationAlert, TransactionKind,
};
use crate::store::{LedgerStore, PoolSource};

/// Postgres-backed ledger store.
///
/// Multi-statement units of work thread an explicit `Transaction`; there is
/// no ambient transaction state. Conditional updates are verified through
/// `rows_affected`, which is what makes the saga's claim step safe under
/// concurrent workers.
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_entry(
        tx: &mut Transaction<'_, Postgres>,
        pool_id: Uuid,
    ) -> AppResult<EscrowEntry> {
        let entry = sqlx::query_as::<_, EscrowEntry>(
            r#"
            SELECT pool_id, total_held, released_amount, withheld_amount,
                   status, withheld_reason, transfer_reference, created_at, updated_at
            FROM escrow_entries
            WHERE pool_id = $1
            "#,
        )
        .bind(pool_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        Ok(entry)
    }

    async fn append_transaction(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Option<Uuid>,
        pool_id: Uuid,
        amount: Decimal,
        fees: Decimal,
        kind: TransactionKind,
        external_ref: Option<&str>,
        metadata: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (id, user_id, pool_id, amount, fees, kind, external_ref, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(pool_id)
        .bind(amount)
        .bind(fees)
        .bind(kind)
        .bind(external_ref)
        .bind(metadata)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Distinguish "entry missing" from "precondition failed" after a guarded
    /// update touched zero rows.
    async fn conflict_or_not_found(&self, pool_id: Uuid, conflict: &str) -> AppError {
        let status = sqlx::query_scalar::<_, EscrowStatus>(
            "SELECT status FROM escrow_entries WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await;

        match status {
            Ok(Some(status)) if !status.allows_balance_mutation() => {
                AppError::Conflict("already processing or released".to_string())
            }
            Ok(Some(_)) => AppError::Conflict(conflict.to_string()),
            Ok(None) => AppError::NotFound(format!("escrow entry for pool {}", pool_id)),
            Err(e) => AppError::Database(e),
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn entry(&self, pool_id: Uuid) -> AppResult<Option<EscrowEntry>> {
        let entry = sqlx::query_as::<_, EscrowEntry>(
            r#"
            SELECT pool_id, total_held, released_amount, withheld_amount,
                   status, withheld_reason, transfer_reference, created_at, updated_at
            FROM escrow_entries
            WHERE pool_id = $1
            "#,
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn contributions(&self, pool_id: Uuid) -> AppResult<HashMap<Uuid, Decimal>> {
        let rows = sqlx::query_as::<_, (Uuid, Decimal)>(
            "SELECT buyer_id, amount FROM escrow_contributions WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn record_contribution(
        &self,
        pool_id: Uuid,
        buyer_id: Uuid,
        amount: Decimal,
    ) -> AppResult<EscrowEntry> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO escrow_entries (pool_id)
            VALUES ($1)
            ON CONFLICT (pool_id) DO NOTHING
            "#,
        )
        .bind(pool_id)
        .execute(&mut *tx)
        .await?;

        // Increments happen in SQL, never as a read-then-write of the map
        // from application memory, so concurrent contributions cannot lose
        // updates.
        sqlx::query(
            r#"
            UPDATE escrow_entries
            SET total_held = total_held + $2, updated_at = NOW()
            WHERE pool_id = $1
            "#,
        )
        .bind(pool_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO escrow_contributions (pool_id, buyer_id, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (pool_id, buyer_id)
            DO UPDATE SET amount = escrow_contributions.amount + EXCLUDED.amount
            "#,
        )
        .bind(pool_id)
        .bind(buyer_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        Self::append_transaction(
            &mut tx,
            Some(buyer_id),
            pool_id,
            amount,
            Decimal::ZERO,
            TransactionKind::EscrowHold,
            None,
            serde_json::json!({ "buyer_id": buyer_id }),
        )
        .await?;

        let entry = Self::fetch_entry(&mut tx, pool_id).await?;
        tx.commit().await?;

        Ok(entry)
    }

    async fn apply_hold(
        &self,
        pool_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE escrow_entries
            SET withheld_amount = withheld_amount + $2,
                withheld_reason = $3,
                updated_at = NOW()
            WHERE pool_id = $1
              AND status IN ('held', 'releasable', 'failed')
              AND total_held - released_amount - withheld_amount >= $2
            "#,
        )
        .bind(pool_id)
        .bind(amount)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self
                .conflict_or_not_found(pool_id, "withhold exceeds available balance")
                .await);
        }

        let entry = Self::fetch_entry(&mut tx, pool_id).await?;
        tx.commit().await?;

        Ok(entry)
    }

    async fn claim_for_release(
        &self,
        pool_id: Uuid,
        transfer_reference: &str,
    ) -> AppResult<EscrowEntry> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE escrow_entries
            SET status = 'processing', transfer_reference = $2, updated_at = NOW()
            WHERE pool_id = $1 AND status IN ('held', 'releasable', 'failed')
            "#,
        )
        .bind(pool_id)
        .bind(transfer_reference)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self
                .conflict_or_not_found(pool_id, "already processing or released")
                .await);
        }

        let entry = Self::fetch_entry(&mut tx, pool_id).await?;
        tx.commit().await?;

        Ok(entry)
    }

    async fn release_failed(&self, pool_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE escrow_entries
            SET status = 'failed', transfer_reference = NULL, updated_at = NOW()
            WHERE pool_id = $1 AND status = 'processing'
            "#,
        )
        .bind(pool_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(%pool_id, "release_failed found no processing entry to revert");
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
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE escrow_entries
            SET released_amount = released_amount + $2,
                status = 'released',
                updated_at = NOW()
            WHERE pool_id = $1 AND status = 'processing'
            "#,
        )
        .bind(pool_id)
        .bind(gross)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::Conflict("escrow is not processing".to_string()));
        }

        Self::append_transaction(
            &mut tx,
            None,
            pool_id,
            net,
            commission,
            TransactionKind::EscrowRelease,
            Some(transfer_code),
            serde_json::json!({ "gross": gross.to_string() }),
        )
        .await?;

        sqlx::query("UPDATE pools SET status = 'completed' WHERE id = $1")
            .bind(pool_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn record_partial_release(
        &self,
        pool_id: Uuid,
        releases: &[(Uuid, Decimal)],
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        let mut tx = self.pool.begin().await?;

        // Lock the entry row so the balance checks and the increment see one
        // consistent snapshot under concurrent releases.
        let entry = sqlx::query_as::<_, EscrowEntry>(
            r#"
            SELECT pool_id, total_held, released_amount, withheld_amount,
                   status, withheld_reason, transfer_reference, created_at, updated_at
            FROM escrow_entries
            WHERE pool_id = $1
            FOR UPDATE
            "#,
        )
        .bind(pool_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("escrow entry for pool {}", pool_id)))?;

        if !entry.status.allows_balance_mutation() {
            tx.rollback().await?;
            return Err(AppError::Conflict(
                "already processing or released".to_string(),
            ));
        }

        let contributions: HashMap<Uuid, Decimal> = sqlx::query_as::<_, (Uuid, Decimal)>(
            "SELECT buyer_id, amount FROM escrow_contributions WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        let mut total = Decimal::ZERO;
        for (buyer_id, amount) in releases {
            let contributed = contributions.get(buyer_id).copied().unwrap_or(Decimal::ZERO);
            if *amount > contributed {
                tx.rollback().await?;
                return Err(AppError::Conflict(format!(
                    "release of {} exceeds buyer {} contribution of {}",
                    amount, buyer_id, contributed
                )));
            }
            total += *amount;
        }

        if !entry.has_available(total) {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "release of {} exceeds available balance of {}",
                total,
                entry.available()
            )));
        }

        sqlx::query(
            r#"
            UPDATE escrow_entries
            SET released_amount = released_amount + $2, updated_at = NOW()
            WHERE pool_id = $1
            "#,
        )
        .bind(pool_id)
        .bind(total)
        .execute(&mut *tx)
        .await?;

        for (buyer_id, amount) in releases {
            Self::append_transaction(
                &mut tx,
                Some(*buyer_id),
                pool_id,
                *amount,
                Decimal::ZERO,
                TransactionKind::Refund,
                None,
                serde_json::json!({ "reason": reason }),
            )
            .await?;
        }

        let entry = Self::fetch_entry(&mut tx, pool_id).await?;
        tx.commit().await?;

        Ok(entry)
    }

    async fn record_manual_release(
        &self,
        pool_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> AppResult<EscrowEntry> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE escrow_entries
            SET released_amount = released_amount + $2, updated_at = NOW()
            WHERE pool_id = $1
              AND status IN ('held', 'releasable', 'failed')
              AND total_held - released_amount - withheld_amount >= $2
            "#,
        )
        .bind(pool_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self
                .conflict_or_not_found(pool_id, "release exceeds available balance")
                .await);
        }

        Self::append_transaction(
            &mut tx,
            None,
            pool_id,
            amount,
            Decimal::ZERO,
            TransactionKind::EscrowRelease,
            None,
            serde_json::json!({ "reason": reason, "manual": true }),
        )
        .await?;

        let entry = Self::fetch_entry(&mut tx, pool_id).await?;
        tx.commit().await?;

        Ok(entry)
    }

    async fn transactions(&self, pool_id: Uuid) -> AppResult<Vec<LedgerTransaction>> {
        let rows = sqlx::query_as::<_, LedgerTransaction>(
            r#"
            SELECT id, user_id, pool_id, amount, fees, kind, external_ref, metadata, created_at
            FROM ledger_transactions
            WHERE pool_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn release_candidates(&self, deadline_cutoff: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let pool_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT e.pool_id
            FROM escrow_entries e
            JOIN pools p ON p.id = e.pool_id
            WHERE e.status IN ('held', 'releasable', 'failed')
              AND p.status IN ('filled', 'in_delivery')
              AND p.delivery_deadline <= $1
              AND e.total_held - e.released_amount - e.withheld_amount > 0
            "#,
        )
        .bind(deadline_cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(pool_ids)
    }

    async fn record_alert(&self, alert: &ReconciliationAlert) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_alerts
                (id, pool_id, transfer_reference, total_held, released_amount, withheld_amount, message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(alert.id)
        .bind(alert.pool_id)
        .bind(&alert.transfer_reference)
        .bind(alert.total_held)
        .bind(alert.released_amount)
        .bind(alert.withheld_amount)
        .bind(&alert.message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PoolSource for PgLedgerStore {
    async fn pool(&self, pool_id: Uuid) -> AppResult<Option<Pool>> {
        let pool = sqlx::query_as::<_, Pool>(
            r#"
            SELECT id, vendor_id, status, delivery_deadline, payout_recipient
            FROM pools
            WHERE id = $1
            "#,
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pool)
    }
}

/// Dispute snapshot read from the dispute collaborator's tables.
pub struct PgDisputeSource {
    pool: PgPool,
}

impl PgDisputeSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DisputeSource for PgDisputeSource {
    async fn active_snapshot(&self, pool_id: Uuid) -> AppResult<DisputeSnapshot> {
        let subscriber_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM escrow_contributions WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_one(&self.pool)
        .await?;

        let active_disputes = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM disputes WHERE pool_id = $1 AND status = 'open'",
        )
        .bind(pool_id)
        .fetch_one(&self.pool)
        .await?;

        let disputant_contributions: HashMap<Uuid, Decimal> =
            sqlx::query_as::<_, (Uuid, Decimal)>(
                r#"
                SELECT c.buyer_id, c.amount
                FROM escrow_contributions c
                JOIN disputes d ON d.pool_id = c.pool_id AND d.raised_by = c.buyer_id
                WHERE c.pool_id = $1 AND d.status = 'open'
                "#,
            )
            .bind(pool_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        Ok(DisputeSnapshot {
            pool_id,
            subscriber_count: subscriber_count as u32,
            active_disputes: active_disputes as u32,
            disputant_contributions,
        })
    }
}
