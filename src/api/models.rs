use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{AppError, AppResult};
use crate::settlement::AwaitingUpdate;

// ========== REQUEST MODELS ==========

/// On-chain batch transfer observed by the blockchain watcher
#[derive(Debug, Deserialize, Validate)]
pub struct BatchTransferRequest {
    #[validate(length(min = 1, message = "tx_ref must not be empty"))]
    pub tx_ref: String,

    #[validate(length(min = 1, message = "payer_address must not be empty"))]
    pub payer_address: String,

    /// Decimal string, wei-like integer units
    #[validate(custom = "validate_amount")]
    pub amount: String,

    /// Only expectations accepted at or before this moment are paid
    pub closure_time: i64,
}

/// Forced single-subtask payment
#[derive(Debug, Deserialize, Validate)]
pub struct ForcedSubtaskPaymentRequest {
    #[validate(length(min = 1, message = "tx_ref must not be empty"))]
    pub tx_ref: String,

    #[validate(length(min = 1, message = "payer_address must not be empty"))]
    pub payer_address: String,

    #[validate(length(min = 1, message = "subtask_id must not be empty"))]
    pub subtask_id: String,

    #[validate(custom = "validate_amount")]
    pub value: String,
}

/// New income expectation for a subtask we computed
#[derive(Debug, Deserialize, Validate)]
pub struct ExpectIncomeRequest {
    #[validate(length(min = 1, message = "sender_node must not be empty"))]
    pub sender_node: String,

    #[validate(length(min = 1, message = "subtask_id must not be empty"))]
    pub subtask_id: String,

    #[validate(length(min = 1, message = "payer_address must not be empty"))]
    pub payer_address: String,

    #[validate(custom = "validate_amount")]
    pub value: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RejectIncomeRequest {
    #[validate(length(min = 1, message = "sender_node must not be empty"))]
    pub sender_node: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SettleIncomeRequest {
    #[validate(length(min = 1, message = "sender_node must not be empty"))]
    pub sender_node: String,

    #[validate(range(min = 0, message = "settled_ts must not be negative"))]
    pub settled_ts: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AcceptIncomeRequest {
    #[validate(length(min = 1, message = "sender_node must not be empty"))]
    pub sender_node: String,

    #[validate(range(min = 0, message = "accepted_ts must not be negative"))]
    pub accepted_ts: i64,
}

// ========== RESPONSE MODELS ==========

/// Whether a forced subtask payment found its expectation
#[derive(Debug, Serialize)]
pub struct ForcedSubtaskPaymentResponse {
    pub subtask_id: String,
    pub matched: bool,
}

/// Outcome of reject / settle; `applied` is false when nothing matched
#[derive(Debug, Serialize)]
pub struct IncomeUpdateResponse {
    pub subtask_id: String,
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct AcceptIncomeResponse {
    pub subtask_id: String,
    pub result: AwaitingUpdate,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub event_subscribers: usize,
    pub timestamp: DateTime<Utc>,
}

// ========== HELPERS ==========

/// Amounts must be non-negative integers that fit in 128 bits
fn validate_amount(raw: &str) -> Result<(), ValidationError> {
    parse_amount(raw)
        .map(|_| ())
        .map_err(|_| ValidationError::new("amount must be a non-negative integer string"))
}

pub fn parse_amount(raw: &str) -> AppResult<u128> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::InvalidInput(format!("Invalid amount: {:?}", raw)));
    }
    trimmed
        .parse()
        .map_err(|_| AppError::InvalidInput(format!("Amount out of range: {}", raw)))
}
