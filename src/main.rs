mod accounts;
mod api;
mod bootstrap;
mod config;
mod error;
mod events;
mod ledger;
mod middleware;
mod network;
mod server;
mod shutdown;
mod signing;
mod store;
mod submitter;
mod sync;
mod worker;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,disbursement_tss=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting disbursement transaction submission service");

    let config = config::Config::from_env().context("loading configuration")?;
    info!(
        tenant_id = %config.tenant_id,
        backend = %config.signing_backend,
        "configuration loaded"
    );

    bootstrap::run(config).await?;

    info!("👋 Shutdown complete");
    Ok(())
}
