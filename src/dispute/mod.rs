use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::AppResult;
use crate::escrow::models::EscrowEntry;

/// Point-in-time view of a pool's disputes, read from the dispute
/// collaborator. Not owned by this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeSnapshot {
    pub pool_id: Uuid,
    pub subscriber_count: u32,
    pub active_disputes: u32,
    /// Cumulative contribution of each buyer with an open dispute.
    pub disputant_contributions: HashMap<Uuid, Decimal>,
}

impl DisputeSnapshot {
    /// Snapshot for a pool with no open disputes.
    pub fn quiet(pool_id: Uuid) -> Self {
        Self {
            pool_id,
            subscriber_count: 0,
            active_disputes: 0,
            disputant_contributions: HashMap::new(),
        }
    }

    pub fn has_active(&self) -> bool {
        self.active_disputes > 0
    }

    /// Fraction of subscribers with an open dispute; zero when the pool has
    /// no subscribers.
    pub fn ratio(&self) -> Decimal {
        if self.subscriber_count == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.active_disputes) / Decimal::from(self.subscriber_count)
    }
}

#[async_trait]
pub trait DisputeSource: Send + Sync {
    async fn active_snapshot(&self, pool_id: Uuid) -> AppResult<DisputeSnapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldClass {
    None,
    Partial,
    Full,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldDecision {
    pub class: HoldClass,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,

    pub reason: Option<String>,
}

/// Dispute-ratio thresholds for withholding escrow funds.
///
/// Both thresholds are inclusive on the lower edge: a ratio of exactly 0.25
/// triggers a partial hold and exactly 0.60 triggers a full hold.
#[derive(Debug, Clone)]
pub struct HoldPolicy {
    pub partial_threshold: Decimal,
    pub full_threshold: Decimal,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            partial_threshold: dec!(0.25),
            full_threshold: dec!(0.60),
        }
    }
}

impl HoldPolicy {
    pub fn new(partial_threshold: Decimal, full_threshold: Decimal) -> Self {
        Self {
            partial_threshold,
            full_threshold,
        }
    }

    pub fn classify(&self, snapshot: &DisputeSnapshot) -> HoldClass {
        let ratio = snapshot.ratio();
        if ratio >= self.full_threshold {
            HoldClass::Full
        } else if ratio >= self.partial_threshold {
            HoldClass::Partial
        } else {
            HoldClass::None
        }
    }

    /// Derive the withhold amount for a pool: the full available balance when
    /// the dispute ratio crosses the upper threshold, the raising buyer's own
    /// cumulative contribution in the partial band, nothing below it.
    pub fn decide(
        &self,
        entry: &EscrowEntry,
        snapshot: &DisputeSnapshot,
        raised_by: Uuid,
    ) -> HoldDecision {
        match self.classify(snapshot) {
            HoldClass::Full => HoldDecision {
                class: HoldClass::Full,
                amount: entry.available(),
                reason: Some(format!(
                    "{} of {} subscribers disputing",
                    snapshot.active_disputes, snapshot.subscriber_count
                )),
            },
            HoldClass::Partial => {
                let amount = snapshot
                    .disputant_contributions
                    .get(&raised_by)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                HoldDecision {
                    class: HoldClass::Partial,
                    amount,
                    reason: Some(format!("dispute raised by buyer {}", raised_by)),
                }
            }
            HoldClass::None => HoldDecision {
                class: HoldClass::None,
                amount: Decimal::ZERO,
                reason: None,
            },
        }
    }
}
