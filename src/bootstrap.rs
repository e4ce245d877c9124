use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    api::handler::AppState,
    config::{Config, StoreBackend},
    error::AppResult,
    events::IncomeEventBroadcaster,
    ledger::{IncomeStore, LedgerRepository, MemoryIncomeStore},
    settlement::{IncomeLifecycle, IncomeReconciler, OverdueMonitor, OverdueScheduleConfig},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Ledger store
    let store: Arc<dyn IncomeStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = initialize_database(&config.database_url, config.db_max_connections).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        StoreBackend::Memory => {
            info!("⚠️  Using in-memory ledger store - incomes are lost on restart");
            Arc::new(MemoryIncomeStore::new())
        }
    };

    // Event fan-out
    let broadcaster = Arc::new(IncomeEventBroadcaster::new());
    broadcaster.spawn_logger();
    info!("✅ Income event broadcaster initialized");

    let reconciler = Arc::new(IncomeReconciler::new(
        store.clone(),
        broadcaster.clone(),
        config.store_retry_attempts,
    ));
    let lifecycle = Arc::new(IncomeLifecycle::new(
        store.clone(),
        config.store_retry_attempts,
    ));
    info!("✅ Income reconciler and lifecycle initialized");

    // Start background overdue sweep
    let monitor = OverdueMonitor::new(
        store.clone(),
        broadcaster.clone(),
        OverdueScheduleConfig {
            payment_deadline: config.payment_deadline(),
            sweep_interval: config.overdue_sweep_interval(),
        },
        config.store_retry_attempts,
    );
    monitor.start();
    info!("✅ Overdue monitor started");

    Ok(AppState {
        store,
        reconciler,
        lifecycle,
        broadcaster,
    })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
