//! HTTP API surface.
//!
//! Intake is synchronous: the handler returns as soon as the intake unit
//! commits, and the provider call happens on the worker pool. The WebSocket
//! feed is advisory; clients reconcile with `GET /api/events?since=` after
//! any gap.

pub mod accounts;
pub mod events;
pub mod payouts;

use crate::models::EventRecord;
use crate::payouts::{PayoutEngine, WorkItem};
use crate::store::Store;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub engine: Arc<PayoutEngine>,
    pub work_tx: mpsc::Sender<WorkItem>,
    pub events_tx: broadcast::Sender<EventRecord>,
}

/// API error wrapper so handlers can use `?` on domain errors.
pub struct ApiError(pub crate::error::PayoutError);

impl From<crate::error::PayoutError> for ApiError {
    fn from(err: crate::error::PayoutError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error serving request");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/payouts/", post(payouts::create_payout))
        .route("/api/payouts", get(payouts::list_payouts))
        .route("/api/payouts/{id}", get(payouts::get_payout))
        .route("/api/payouts/{id}/cancel", post(payouts::cancel_payout))
        .route("/api/events", get(events::get_events))
        .route("/api/accounts/{code}/balance", get(accounts::get_balance))
        .route("/ws", get(events::websocket_handler))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
