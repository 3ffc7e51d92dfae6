use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use escrow_engine::{bootstrap, config::Config};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,escrow_engine=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("starting escrow & settlement engine");

    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let engine = bootstrap::initialize(&config).await?;

    info!("engine running");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    engine.scheduler_handle.abort();
    engine.worker_handle.abort();

    Ok(())
}
