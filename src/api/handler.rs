use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::*;
use crate::{
    error::AppResult,
    events::IncomeEventBroadcaster,
    ledger::{Income, IncomeStore},
    middleware::ValidatedJson,
    settlement::{BatchOutcome, IncomeLifecycle, IncomeReconciler},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IncomeStore>,
    pub reconciler: Arc<IncomeReconciler>,
    pub lifecycle: Arc<IncomeLifecycle>,
    pub broadcaster: Arc<IncomeEventBroadcaster>,
}

/// POST /webhook/batch-transfer
pub async fn batch_transfer_webhook(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<BatchTransferRequest>,
) -> AppResult<Json<BatchOutcome>> {
    info!(
        "📥 Batch transfer {} from {} (closure {})",
        payload.tx_ref, payload.payer_address, payload.closure_time
    );

    let amount = parse_amount(&payload.amount)?;
    let outcome = state
        .reconciler
        .process_batch_transfer(
            &payload.tx_ref,
            &payload.payer_address,
            amount,
            payload.closure_time,
        )
        .await?;

    log_outcome(&payload.tx_ref, &outcome);
    Ok(Json(outcome))
}

/// POST /webhook/forced-payment
pub async fn forced_payment_webhook(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<BatchTransferRequest>,
) -> AppResult<Json<BatchOutcome>> {
    let amount = parse_amount(&payload.amount)?;
    let outcome = state
        .reconciler
        .process_forced_payment(
            &payload.tx_ref,
            &payload.payer_address,
            amount,
            payload.closure_time,
        )
        .await?;

    log_outcome(&payload.tx_ref, &outcome);
    Ok(Json(outcome))
}

/// POST /webhook/forced-subtask-payment
pub async fn forced_subtask_payment_webhook(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<ForcedSubtaskPaymentRequest>,
) -> AppResult<Json<ForcedSubtaskPaymentResponse>> {
    let value = parse_amount(&payload.value)?;
    let matched = state
        .reconciler
        .process_forced_subtask_payment(
            &payload.tx_ref,
            &payload.payer_address,
            &payload.subtask_id,
            value,
        )
        .await?;

    Ok(Json(ForcedSubtaskPaymentResponse {
        subtask_id: payload.subtask_id,
        matched,
    }))
}

/// POST /incomes
pub async fn expect_income(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<ExpectIncomeRequest>,
) -> AppResult<(StatusCode, Json<Income>)> {
    let value = parse_amount(&payload.value)?;
    let income = state
        .lifecycle
        .expect(
            &payload.sender_node,
            &payload.subtask_id,
            &payload.payer_address,
            value,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(income)))
}

/// POST /incomes/:subtask_id/reject
pub async fn reject_income(
    State(state): State<AppState>,
    Path(subtask_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<RejectIncomeRequest>,
) -> AppResult<Json<IncomeUpdateResponse>> {
    let applied = state
        .lifecycle
        .reject(&payload.sender_node, &subtask_id)
        .await?;

    Ok(Json(IncomeUpdateResponse {
        subtask_id,
        applied,
    }))
}

/// POST /incomes/:subtask_id/settle
pub async fn settle_income(
    State(state): State<AppState>,
    Path(subtask_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<SettleIncomeRequest>,
) -> AppResult<Json<IncomeUpdateResponse>> {
    let applied = state
        .lifecycle
        .settle(&payload.sender_node, &subtask_id, payload.settled_ts)
        .await?;

    Ok(Json(IncomeUpdateResponse {
        subtask_id,
        applied,
    }))
}

/// POST /incomes/:subtask_id/accept
pub async fn accept_income(
    State(state): State<AppState>,
    Path(subtask_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<AcceptIncomeRequest>,
) -> AppResult<Json<AcceptIncomeResponse>> {
    let result = state
        .lifecycle
        .update_awaiting(&payload.sender_node, &subtask_id, payload.accepted_ts)
        .await?;

    Ok(Json(AcceptIncomeResponse { subtask_id, result }))
}

/// GET /incomes
pub async fn list_incomes(State(state): State<AppState>) -> AppResult<Json<Vec<Income>>> {
    let incomes = state.lifecycle.list_all_incomes().await?;
    Ok(Json(incomes))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, store) = match state.store.ping().await {
        Ok(()) => ("healthy", "reachable".to_string()),
        Err(e) => {
            warn!("Health check: ledger store unreachable: {}", e);
            ("degraded", e.to_string())
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        store,
        event_subscribers: state.broadcaster.subscriber_count(),
        timestamp: Utc::now(),
    })
}

fn log_outcome(tx_ref: &str, outcome: &BatchOutcome) {
    if outcome.is_duplicate() {
        info!("🔁 Transfer {} matched nothing outstanding, treated as re-delivery", tx_ref);
    } else {
        info!(
            "Transfer {} paid {} of {} expected ({} confirmed)",
            tx_ref,
            outcome.distributed,
            outcome.expected_total,
            outcome.confirmed.len()
        );
    }
}
