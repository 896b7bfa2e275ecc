//! Payout endpoints.

use super::{ApiError, AppState};
use crate::amount::{Amount, Currency};
use crate::error::PayoutError;
use crate::models::{Payout, PayoutStatus};
use crate::payouts::{PayoutRequest, WorkItem};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct CreatePayoutBody {
    pub idempotency_key: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub recipient_account: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub id: String,
    pub idempotency_key: String,
    pub amount: String,
    pub currency: String,
    pub recipient_account: String,
    pub recipient_name: String,
    pub description: String,
    pub metadata: Value,
    pub status: PayoutStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_payout_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
}

impl From<Payout> for PayoutResponse {
    fn from(p: Payout) -> Self {
        PayoutResponse {
            id: p.id,
            idempotency_key: p.idempotency_key,
            amount: p.amount.to_string(),
            currency: p.amount.currency().as_str().to_string(),
            recipient_account: p.recipient_account,
            recipient_name: p.recipient_name,
            description: p.description,
            metadata: p.metadata,
            status: p.status,
            ledger_transaction_id: p.ledger_transaction_id,
            external_payout_id: p.external_payout_id,
            external_reference: p.external_reference,
            error_message: p.error_message,
            retry_count: p.retry_count,
            created_at: p.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            updated_at: p.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            processed_at: p
                .processed_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, PayoutError> {
    field
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PayoutError::Validation(format!("{name} is required")))
}

/// `POST /api/payouts/`: 201 on create, 200 on idempotent replay, 409 on
/// conflicting payload.
pub async fn create_payout(
    State(state): State<AppState>,
    Json(body): Json<CreatePayoutBody>,
) -> Result<(StatusCode, Json<PayoutResponse>), ApiError> {
    let idempotency_key = required(body.idempotency_key, "idempotency_key")?;
    let amount_str = required(body.amount, "amount")?;
    let recipient_account = required(body.recipient_account, "recipient_account")?;

    let currency = match body.currency {
        Some(code) if !code.trim().is_empty() => {
            Currency::new(&code).map_err(PayoutError::Amount)?
        }
        _ => Currency::usd(),
    };
    let amount = Amount::parse(&amount_str, currency).map_err(PayoutError::Amount)?;

    let request = PayoutRequest {
        idempotency_key,
        amount,
        recipient_account,
        recipient_name: body.recipient_name.unwrap_or_default(),
        description: body.description.unwrap_or_default(),
        metadata: body.metadata.unwrap_or_else(|| Value::Object(Default::default())),
    };

    let outcome = state.engine.intake(request)?;

    // Hand the payout to the workers; a dropped enqueue is recovered at the
    // next startup scan, so it must not fail the request.
    if outcome.payout.status == PayoutStatus::Pending {
        if let Err(e) = state
            .work_tx
            .try_send(WorkItem::ProcessPayout {
                payout_id: outcome.payout.id.clone(),
            })
        {
            warn!(payout_id = %outcome.payout.id, error = %e, "failed to enqueue payout work");
        }
    }

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.payout.into())))
}

/// `GET /api/payouts/{id}`
pub async fn get_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PayoutResponse>, ApiError> {
    let payout = state
        .engine
        .get(&id)?
        .ok_or_else(|| PayoutError::NotFound(format!("payout {id}")))?;
    Ok(Json(payout.into()))
}

/// `POST /api/payouts/{id}/cancel`
pub async fn cancel_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PayoutResponse>, ApiError> {
    let payout = state.engine.cancel(&id)?;
    Ok(Json(payout.into()))
}

#[derive(Debug, Deserialize)]
pub struct PayoutListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    /// Keyset cursor: `created_at` of the last payout on the previous page.
    pub before: Option<String>,
    /// Keyset cursor: `id` of the last payout on the previous page.
    pub before_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PayoutListResponse {
    pub payouts: Vec<PayoutResponse>,
    pub count: usize,
}

/// `GET /api/payouts?status=&limit=&before=&before_id=`
pub async fn list_payouts(
    State(state): State<AppState>,
    Query(query): Query<PayoutListQuery>,
) -> Result<Json<PayoutListResponse>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            PayoutStatus::parse(&raw.to_ascii_uppercase())
                .ok_or_else(|| PayoutError::Validation(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).min(500);

    let cursor = match (query.before.as_deref(), query.before_id.as_deref()) {
        (Some(ts), Some(id)) => Some((ts, id)),
        (None, None) => None,
        _ => {
            return Err(ApiError(PayoutError::Validation(
                "before and before_id must be supplied together".to_string(),
            )))
        }
    };

    let payouts = state.engine.list(status, cursor, limit)?;
    let count = payouts.len();
    Ok(Json(PayoutListResponse {
        payouts: payouts.into_iter().map(Into::into).collect(),
        count,
    }))
}
