#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use escrow_engine::dispute::HoldPolicy;
use escrow_engine::error::{AppError, AppResult};
use escrow_engine::escrow::models::{Pool, PoolStatus};
use escrow_engine::escrow::EscrowService;
use escrow_engine::notify::{NotificationKind, NotificationSink};
use parking_lot::Mutex;
use escrow_engine::settlement::ReleaseProcessor;
use escrow_engine::store::{MemoryDisputeSource, MemoryStore};
use escrow_engine::transfer::{TransferProvider, TransferReceipt};

pub const COMMISSION_RATE: Decimal = dec!(0.05);
pub const GRACE_HOURS: i64 = 48;

/// Transfer provider double: counts calls and can be told to fail the next
/// N transfers.
#[derive(Default)]
pub struct MockTransferProvider {
    calls: AtomicU32,
    fail_remaining: AtomicU32,
}

impl MockTransferProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferProvider for MockTransferProvider {
    async fn initiate_transfer(
        &self,
        _amount: Decimal,
        _recipient: &str,
        _narrative: &str,
        idempotency_ref: &str,
    ) -> AppResult<TransferReceipt> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::ExternalService(
                "provider unavailable".to_string(),
            ));
        }

        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TransferReceipt {
            transfer_code: format!("TRF_{}_{}", n, idempotency_ref),
            status: "success".to_string(),
        })
    }

    async fn create_recipient(
        &self,
        _name: &str,
        _account_number: &str,
        _bank_code: &str,
    ) -> AppResult<String> {
        Ok("RCP_test".to_string())
    }
}

/// Notification sink double: records the kinds delivered.
#[derive(Default)]
pub struct MockNotifier {
    events: Mutex<Vec<NotificationKind>>,
}

impl MockNotifier {
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for MockNotifier {
    async fn notify(
        &self,
        _recipient: Uuid,
        kind: NotificationKind,
        _payload: serde_json::Value,
    ) -> AppResult<()> {
        self.events.lock().push(kind);
        Ok(())
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub disputes: MemoryDisputeSource,
    pub transfers: Arc<MockTransferProvider>,
    pub notifier: Arc<MockNotifier>,
    pub service: Arc<EscrowService>,
    pub processor: Arc<ReleaseProcessor>,
}

pub fn harness() -> Harness {
    let store = MemoryStore::new();
    let disputes = MemoryDisputeSource::new();
    let transfers = Arc::new(MockTransferProvider::new());
    let notifier = Arc::new(MockNotifier::default());

    let service = Arc::new(EscrowService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(disputes.clone()),
        notifier.clone(),
        HoldPolicy::default(),
        COMMISSION_RATE,
    ));

    let processor = Arc::new(ReleaseProcessor::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(disputes.clone()),
        transfers.clone(),
        notifier.clone(),
        COMMISSION_RATE,
        Duration::hours(GRACE_HOURS),
    ));

    Harness {
        store,
        disputes,
        transfers,
        notifier,
        service,
        processor,
    }
}

/// Seed a pool whose grace period has already elapsed.
pub async fn seed_releasable_pool(h: &Harness) -> Uuid {
    seed_pool(
        h,
        PoolStatus::Filled,
        Utc::now() - Duration::hours(GRACE_HOURS + 1),
    )
    .await
}

pub async fn seed_pool(h: &Harness, status: PoolStatus, deadline: DateTime<Utc>) -> Uuid {
    let pool_id = Uuid::new_v4();
    h.store
        .insert_pool(Pool {
            id: pool_id,
            vendor_id: Uuid::new_v4(),
            status,
            delivery_deadline: deadline,
            payout_recipient: "RCP_vendor".to_string(),
        })
        .await;
    pool_id
}
