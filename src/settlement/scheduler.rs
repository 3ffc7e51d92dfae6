use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::error::AppResult;
use crate::settlement::queue::{ReleaseJob, ReleaseQueue};
use crate::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scan_interval: Duration,
    pub grace_period: ChronoDuration,
}

/// Periodic release trigger: scans for pools whose grace period has elapsed
/// and enqueues one saga execution per candidate.
///
/// Duplicate scans for the same pool before the previous job completes are
/// harmless - the saga's conditional claim rejects the second execution.
pub struct ReleaseScheduler {
    store: Arc<dyn LedgerStore>,
    queue: ReleaseQueue,
    config: SchedulerConfig,
}

impl ReleaseScheduler {
    pub fn new(store: Arc<dyn LedgerStore>, queue: ReleaseQueue, config: SchedulerConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Run the scan loop in the background.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.scan_interval);
            loop {
                ticker.tick().await;
                match self.scan().await {
                    Ok(enqueued) if enqueued > 0 => {
                        info!(enqueued, "release scan enqueued jobs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(%e, "release scan failed"),
                }
            }
        })
    }

    /// One scan pass. A pool is a candidate when its escrow is still
    /// releasable, the pool accepts release, and `now >= deadline + grace`.
    pub async fn scan(&self) -> AppResult<usize> {
        let cutoff = Utc::now() - self.config.grace_period;
        let candidates = self.store.release_candidates(cutoff).await?;

        let mut enqueued = 0;
        for pool_id in candidates {
            if self.queue.enqueue(ReleaseJob::scheduled(pool_id)) {
                enqueued += 1;
            }
        }

        Ok(enqueued)
    }
}
