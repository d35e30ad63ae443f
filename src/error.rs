use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::jobs::models::JobStatus;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Rejections raised while creating or previewing a job. Never persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {field} address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(String),

    #[error("Amount {amount} has more than {decimals} fractional digits")]
    TooManyDecimals { amount: String, decimals: u32 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Scheduled time {0} is in the past")]
    ScheduleInPast(String),

    #[error("Unknown frequency: {0}")]
    UnknownFrequency(String),

    #[error("Invalid max executions: {0}")]
    InvalidMaxExecutions(String),

    #[error("Native asset mismatch: {0}")]
    NativeAssetMismatch(String),

    #[error("Token assets require a contract address")]
    MissingContractAddress,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Job store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("Duplicate schedule id: {0}")]
    Duplicate(String),

    #[error("Corrupt job record {schedule_id}: {message}")]
    Corrupt { schedule_id: String, message: String },

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

/// Ledger RPC failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Transfer execution failures. Every variant is terminal for the job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("Transaction simulation reverted: {0}")]
    SimulationReverted(String),

    #[error("Transaction {tx_hash} reverted on-chain")]
    Reverted { tx_hash: String },

    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("Confirmation timeout for {tx_hash} after {waited_secs}s")]
    ConfirmationTimeout { tx_hash: String, waited_secs: u64 },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Ledger RPC error: {0}")]
    Rpc(#[from] RpcError),
}

/// Raised when a confirmed transfer could not be written back to the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("Failed to record confirmed execution of {schedule_id} (tx {tx_hash}) after {attempts} attempts")]
    WriteFailure {
        schedule_id: String,
        tx_hash: String,
        attempts: u32,
    },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                err.to_string(),
                None,
            ),
            AppError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "JOB_NOT_FOUND",
                format!("Job not found: {}", id),
                Some(serde_json::json!({ "schedule_id": id })),
            ),
            AppError::Conflict(message) => (
                StatusCode::CONFLICT,
                "JOB_STATE_CONFLICT",
                message,
                None,
            ),
            AppError::Store(StoreError::Duplicate(id)) => (
                StatusCode::CONFLICT,
                "DUPLICATE_SCHEDULE",
                format!("Schedule already exists: {}", id),
                None,
            ),
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                "A job store error occurred".to_string(),
                None,
            ),
            AppError::Rpc(err) => (
                StatusCode::BAD_GATEWAY,
                "LEDGER_UNAVAILABLE",
                err.to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(error: reqwest::Error) -> Self {
        RpcError::Transport(format!("HTTP request error: {}", error))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::Validation(ValidationError::InvalidInput(message))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
