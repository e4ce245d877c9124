use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::{
    handler::{
        accept_income, batch_transfer_webhook, expect_income, forced_payment_webhook,
        forced_subtask_payment_webhook, health_check, list_incomes, reject_income, settle_income,
        AppState,
    },
    streaming::stream_income_events,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Blockchain watcher webhooks
                .route("/webhook/batch-transfer", post(batch_transfer_webhook))
                .route("/webhook/forced-payment", post(forced_payment_webhook))
                .route(
                    "/webhook/forced-subtask-payment",
                    post(forced_subtask_payment_webhook),
                )
                // Task-acceptance workflow
                .route("/incomes", post(expect_income).get(list_incomes))
                .route("/incomes/events", get(stream_income_events))
                .route("/incomes/:subtask_id/reject", post(reject_income))
                .route("/incomes/:subtask_id/settle", post(settle_income))
                .route("/incomes/:subtask_id/accept", post(accept_income)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
