//! Caller-visible error kinds.
//!
//! Validation and conflict errors are reported to callers, transient
//! failures are retried by the dispatcher, and ledger invariant breaches
//! abort the atomic unit they occurred in.

use crate::amount::AmountError;
use crate::models::PayoutStatus;
use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PayoutError>;

#[derive(Debug, Error)]
pub enum PayoutError {
    /// Malformed input (missing fields, non-positive amount, bad currency).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Same idempotency key, different payload.
    #[error("idempotency key already used with a different payload")]
    IdempotencyConflict,

    /// The state machine forbids this move.
    #[error("cannot {action} a payout in status {from}")]
    IllegalTransition {
        from: PayoutStatus,
        action: &'static str,
    },

    /// Debit and credit legs differ in amount or currency.
    #[error("ledger transaction does not balance")]
    Unbalanced,

    /// Ledger entries must carry strictly positive amounts.
    #[error("ledger entry amount must be positive")]
    NonPositiveAmount,

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// An existing row disagrees with the requested write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl PayoutError {
    /// HTTP status for API responses.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PayoutError::Validation(_) | PayoutError::Amount(_) => StatusCode::BAD_REQUEST,
            PayoutError::IdempotencyConflict
            | PayoutError::IllegalTransition { .. }
            | PayoutError::Conflict(_) => StatusCode::CONFLICT,
            PayoutError::NotFound(_) => StatusCode::NOT_FOUND,
            PayoutError::Unbalanced
            | PayoutError::NonPositiveAmount
            | PayoutError::UnknownAccount(_)
            | PayoutError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind tag for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PayoutError::Validation(_) => "validation_error",
            PayoutError::IdempotencyConflict => "idempotency_conflict",
            PayoutError::IllegalTransition { .. } => "illegal_transition",
            PayoutError::Unbalanced => "unbalanced",
            PayoutError::NonPositiveAmount => "non_positive_amount",
            PayoutError::UnknownAccount(_) => "unknown_account",
            PayoutError::Conflict(_) => "conflict",
            PayoutError::NotFound(_) => "not_found",
            PayoutError::Amount(_) => "validation_error",
            PayoutError::Storage(_) => "storage_error",
        }
    }
}
