use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sqlx::migrate::MigrateError;
use serde::Serialize;
use thiserror::Error;

/// PostgreSQL SQLSTATE codes worth re-running a transaction for
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store busy: {0}")]
    StoreBusy(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AppError {
    /// Transient store conflicts; the whole transaction may be re-run.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::StoreBusy(_) => true,
            AppError::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            AppError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Map a unique-key violation into `Conflict`, leave everything else as is.
    pub fn from_insert(error: sqlx::Error, what: impl Into<String>) -> Self {
        if let sqlx::Error::Database(db) = &error {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return AppError::Conflict(what.into());
            }
        }
        AppError::Database(error)
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg),
            AppError::StoreBusy(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_BUSY",
                "Ledger store is busy, retry later".to_string(),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
