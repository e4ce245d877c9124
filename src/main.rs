mod api;
mod bootstrap;
mod config;
mod error;
mod events;
mod ledger;
mod middleware;
mod server;
mod settlement;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,income_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting income ledger");

    let config = Config::from_env().context("loading configuration")?;
    info!(
        "Store backend: {:?}, payment deadline: {}s",
        config.store_backend, config.payment_deadline_secs
    );

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("initializing application state")?;

    let app = server::create_app(state).await;

    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
