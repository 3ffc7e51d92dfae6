use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::settlement::processor::{ReleaseOutcome, ReleaseProcessor, ReleaseTrigger};
use crate::settlement::reconciliation::ReconciliationReporter;

/// One saga execution request.
#[derive(Debug, Clone)]
pub struct ReleaseJob {
    pub pool_id: Uuid,
    pub trigger: ReleaseTrigger,
    pub reason: String,
    pub force: bool,
}

impl ReleaseJob {
    pub fn scheduled(pool_id: Uuid) -> Self {
        Self {
            pool_id,
            trigger: ReleaseTrigger::Scheduled,
            reason: "grace period elapsed".to_string(),
            force: false,
        }
    }
}

/// Hand-off channel between the release trigger and the worker.
///
/// Enqueueing the same pool twice is tolerated; the pending set only trims
/// obvious duplicates while a job is in flight. Correctness does not depend
/// on it - the saga's conditional claim makes a duplicate execution fail fast
/// with `Conflict`.
#[derive(Clone)]
pub struct ReleaseQueue {
    tx: mpsc::UnboundedSender<ReleaseJob>,
    pending: Arc<Mutex<HashSet<Uuid>>>,
}

impl ReleaseQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReleaseJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Returns false when the pool already has a job in flight or the worker
    /// side is gone.
    pub fn enqueue(&self, job: ReleaseJob) -> bool {
        {
            let mut pending = self.pending.lock();
            if !pending.insert(job.pool_id) {
                return false;
            }
        }

        if self.tx.send(job).is_err() {
            warn!("release worker is gone, dropping job");
            return false;
        }
        true
    }
}

/// Consumes release jobs, retrying transfer failures with linear backoff up
/// to a bounded attempt count. Exhausted budgets and reconciliation errors go
/// to the reporter, never into the void.
pub struct ReleaseWorker {
    processor: Arc<ReleaseProcessor>,
    reporter: Arc<ReconciliationReporter>,
    // Only the pending set, never the sender: holding a sender here would
    // keep the channel open and the worker could not observe shutdown.
    pending: Arc<Mutex<HashSet<Uuid>>>,
    rx: mpsc::UnboundedReceiver<ReleaseJob>,
    max_attempts: u32,
    backoff: Duration,
}

impl ReleaseWorker {
    pub fn new(
        processor: Arc<ReleaseProcessor>,
        reporter: Arc<ReconciliationReporter>,
        queue: ReleaseQueue,
        rx: mpsc::UnboundedReceiver<ReleaseJob>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            processor,
            reporter,
            pending: queue.pending,
            rx,
            max_attempts,
            backoff,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            let pool_id = job.pool_id;
            self.process(job).await;
            self.pending.lock().remove(&pool_id);
        }
        info!("release queue closed, worker stopping");
    }

    async fn process(&self, job: ReleaseJob) {
        let mut attempt: u32 = 1;
        loop {
            let result = self
                .processor
                .request_release(job.pool_id, job.trigger, &job.reason, job.force)
                .await;

            match result {
                Ok(ReleaseOutcome::Released(receipt)) => {
                    info!(
                        pool_id = %job.pool_id,
                        net = %receipt.net,
                        transfer_code = %receipt.transfer_code,
                        attempt,
                        "release job completed"
                    );
                    return;
                }
                Ok(ReleaseOutcome::Skipped(skip)) => {
                    info!(
                        pool_id = %job.pool_id,
                        skipped = skip.as_str(),
                        trigger = job.trigger.as_str(),
                        "release job skipped"
                    );
                    return;
                }
                Err(AppError::Reconciliation {
                    pool_id,
                    transfer_reference,
                    message,
                }) => {
                    self.reporter
                        .reconciliation_required(pool_id, transfer_reference, &message)
                        .await;
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        pool_id = %job.pool_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        %e,
                        "release attempt failed, backing off"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    self.reporter
                        .retries_exhausted(job.pool_id, attempt, &e)
                        .await;
                    return;
                }
                Err(e) => {
                    // Validation/NotFound/Conflict: the caller must re-derive
                    // state; retrying would produce the same answer.
                    warn!(pool_id = %job.pool_id, %e, "release job failed terminally");
                    return;
                }
            }
        }
    }
}
