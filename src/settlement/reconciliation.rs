use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::error::AppError;
use crate::escrow::models::ReconciliationAlert;
use crate::store::LedgerStore;

/// Surfaces saga outcomes that require a human.
///
/// This is the only place financial discrepancies become visible for action:
/// a persisted alert row plus a structured error log, distinct from ordinary
/// job failures. End users never see this detail.
pub struct ReconciliationReporter {
    store: Arc<dyn LedgerStore>,
}

impl ReconciliationReporter {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Raise an operator alert carrying the pool, the transfer reference and
    /// the last known amounts.
    pub async fn reconciliation_required(
        &self,
        pool_id: Uuid,
        transfer_reference: Option<String>,
        message: &str,
    ) {
        let entry = self.store.entry(pool_id).await.ok().flatten();

        let (total_held, released_amount, withheld_amount) = entry
            .as_ref()
            .map(|e| (e.total_held, e.released_amount, e.withheld_amount))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO, Decimal::ZERO));
        let transfer_reference =
            transfer_reference.or_else(|| entry.and_then(|e| e.transfer_reference));

        error!(
            target: "reconciliation",
            %pool_id,
            ?transfer_reference,
            %total_held,
            %released_amount,
            %withheld_amount,
            "OPERATOR ACTION REQUIRED: {}",
            message
        );

        let alert = ReconciliationAlert {
            id: Uuid::new_v4(),
            pool_id,
            transfer_reference,
            total_held,
            released_amount,
            withheld_amount,
            message: message.to_string(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.record_alert(&alert).await {
            error!(%pool_id, %e, "failed to persist reconciliation alert");
        }
    }

    /// A release job burned through its retry budget; hand it over instead of
    /// dropping it.
    pub async fn retries_exhausted(&self, pool_id: Uuid, attempts: u32, last_error: &AppError) {
        let message = format!(
            "release retry budget exhausted after {} attempts: {}",
            attempts, last_error
        );
        self.reconciliation_required(pool_id, None, &message).await;
    }
}
