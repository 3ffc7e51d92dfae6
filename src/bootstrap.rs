use chrono::Duration as ChronoDuration;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::dispute::{DisputeSource, HoldPolicy};
use crate::error::AppResult;
use crate::escrow::EscrowService;
use crate::notify::TracingNotifier;
use crate::settlement::{
    ReconciliationReporter, ReleaseProcessor, ReleaseQueue, ReleaseScheduler, ReleaseWorker,
    SchedulerConfig,
};
use crate::store::{LedgerStore, PgDisputeSource, PgLedgerStore, PoolSource};
use crate::transfer::HttpTransferProvider;

/// Wired-up engine: service handles plus the background task handles.
pub struct Engine {
    pub service: Arc<EscrowService>,
    pub processor: Arc<ReleaseProcessor>,
    pub queue: ReleaseQueue,
    pub scheduler_handle: JoinHandle<()>,
    pub worker_handle: JoinHandle<()>,
}

pub async fn initialize(config: &Config) -> AppResult<Engine> {
    info!("initializing escrow engine components");

    let pool = initialize_database(&config.database_url).await?;

    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let ledger: Arc<dyn LedgerStore> = store.clone();
    let pools: Arc<dyn PoolSource> = store;
    let disputes: Arc<dyn DisputeSource> = Arc::new(PgDisputeSource::new(pool.clone()));

    let transfers = Arc::new(HttpTransferProvider::new(
        &config.transfer_api_url,
        &config.transfer_api_secret,
        Duration::from_secs(config.transfer_timeout_secs),
    )?);
    let notifier = Arc::new(TracingNotifier);

    let policy = HoldPolicy::new(config.partial_hold_threshold, config.full_hold_threshold);
    let grace_period = ChronoDuration::hours(config.grace_period_hours);

    let service = Arc::new(EscrowService::new(
        ledger.clone(),
        pools.clone(),
        disputes.clone(),
        notifier.clone(),
        policy,
        config.commission_rate,
    ));

    let processor = Arc::new(ReleaseProcessor::new(
        ledger.clone(),
        pools,
        disputes,
        transfers,
        notifier,
        config.commission_rate,
        grace_period,
    ));

    let reporter = Arc::new(ReconciliationReporter::new(ledger.clone()));

    let (queue, rx) = ReleaseQueue::new();
    let worker_handle = ReleaseWorker::new(
        processor.clone(),
        reporter,
        queue.clone(),
        rx,
        config.max_release_attempts,
        Duration::from_secs(config.retry_backoff_secs),
    )
    .start();
    info!("release worker started");

    let scheduler_handle = ReleaseScheduler::new(
        ledger,
        queue.clone(),
        SchedulerConfig {
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            grace_period,
        },
    )
    .start();
    info!(
        scan_interval_secs = config.scan_interval_secs,
        grace_period_hours = config.grace_period_hours,
        "release scheduler started"
    );

    Ok(Engine {
        service,
        processor,
        queue,
        scheduler_handle,
        worker_handle,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("connecting to database");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("database initialized");
    Ok(pool)
}
