//! Event feed endpoints: ordered HTTP reads and the advisory WebSocket
//! stream.

use super::{ApiError, AppState};
use crate::events;
use crate::models::EventRecord;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{Json, Response};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Exclusive lower bound on sequence number. Defaults to 0 (everything).
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub sequence_number: i64,
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: String,
}

impl From<EventRecord> for EventResponse {
    fn from(e: EventRecord) -> Self {
        EventResponse {
            sequence_number: e.sequence_number,
            event_id: e.event_id,
            aggregate_type: e.aggregate_type,
            aggregate_id: e.aggregate_id,
            event_type: e.event_type,
            payload: e.payload,
            created_at: e.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<EventResponse>,
    pub count: usize,
}

/// `GET /api/events?since=<seq>&limit=<n>`, strictly ascending sequence.
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventListResponse>, ApiError> {
    let since = query.since.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);

    let records = state
        .store
        .read(|conn| events::events_since(conn, since, limit))?;
    let count = records.len();
    Ok(Json(EventListResponse {
        events: records.into_iter().map(Into::into).collect(),
        count,
    }))
}

/// `GET /ws` streams committed events as they are published. Best effort:
/// a lagging client is disconnected and reconciles over HTTP.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let rx = state.events_tx.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(mut socket: WebSocket, mut rx: broadcast::Receiver<EventRecord>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let body = match serde_json::to_string(&EventResponse::from(event)) {
                    Ok(body) => body,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(body.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "websocket subscriber lagged, closing");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
