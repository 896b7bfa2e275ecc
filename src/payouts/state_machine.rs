//! Payout state machine.
//!
//! Every transition runs in one atomic unit that owns the payout row for its
//! duration, appends the describing event and updates the read models before
//! committing. Ledger entries are created only when a payout completes, so a
//! crashed worker never leaves provisional entries behind.
//!
//! ```text
//!         intake
//!   ∅  ─────────▶  Pending ──cancel──▶ Cancelled
//!                    │ claim
//!                    ▼
//!                 Processing ──▶ Completed
//!                    │
//!                    └─────────▶ Failed (after max retries)
//! ```

use crate::amount::{Amount, Currency};
use crate::error::{PayoutError, Result};
use crate::events::{self, NewEvent, SequenceAllocator};
use crate::ledger::{self, NewLedgerTransaction};
use crate::models::{EventRecord, Payout, PayoutStatus};
use crate::projection;
use crate::store::{
    ignore_no_rows, Store, CASH_ACCOUNT_CODE, PAYOUT_LIABILITY_ACCOUNT_CODE,
};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

const AGGREGATE_PAYOUT: &str = "payout";

/// Validated intake request.
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub idempotency_key: String,
    pub amount: Amount,
    pub recipient_account: String,
    pub recipient_name: String,
    pub description: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct IntakeOutcome {
    pub payout: Payout,
    /// False when the request was an idempotent replay of an existing payout.
    pub created: bool,
}

/// Result of `finalize_failure`: either the payout stays in `Processing`
/// awaiting another attempt, or it is terminally failed.
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    RetryScheduled(Payout),
    Failed(Payout),
}

impl FailureOutcome {
    pub fn payout(&self) -> &Payout {
        match self {
            FailureOutcome::RetryScheduled(p) | FailureOutcome::Failed(p) => p,
        }
    }
}

/// Coordinates ledger, event log and projections for payout transitions.
pub struct PayoutEngine {
    store: Store,
    allocator: Arc<dyn SequenceAllocator>,
    events_tx: broadcast::Sender<EventRecord>,
    max_retries: u32,
}

impl PayoutEngine {
    pub fn new(
        store: Store,
        allocator: Arc<dyn SequenceAllocator>,
        events_tx: broadcast::Sender<EventRecord>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            allocator,
            events_tx,
            max_retries,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Idempotent intake. Exactly one payout row per idempotency key; a
    /// replay with the same payload returns the stored payout, a replay with
    /// a different payload is rejected without any mutation.
    pub fn intake(&self, req: PayoutRequest) -> Result<IntakeOutcome> {
        validate_request(&req)?;

        let (outcome, published) = self.store.with_txn(|txn| {
            if let Some(existing) = load_payout_by_key(txn, &req.idempotency_key)? {
                if !request_matches(&existing, &req) {
                    return Err(PayoutError::IdempotencyConflict);
                }
                debug!(
                    idempotency_key = %req.idempotency_key,
                    payout_id = %existing.id,
                    "idempotent intake replay"
                );
                return Ok((
                    IntakeOutcome {
                        payout: existing,
                        created: false,
                    },
                    Vec::new(),
                ));
            }

            let now = Utc::now();
            let payout = Payout {
                id: Uuid::new_v4().to_string(),
                idempotency_key: req.idempotency_key.clone(),
                amount: req.amount.clone(),
                recipient_account: req.recipient_account.clone(),
                recipient_name: req.recipient_name.clone(),
                description: req.description.clone(),
                metadata: req.metadata.clone(),
                status: PayoutStatus::Pending,
                ledger_transaction_id: None,
                external_payout_id: None,
                external_reference: None,
                error_message: None,
                retry_count: 0,
                created_at: now,
                updated_at: now,
                processed_at: None,
            };
            insert_payout(txn, &payout)?;

            let event = events::append_event(
                txn,
                self.allocator.as_ref(),
                NewEvent {
                    event_id: &format!("payout.created:{}", payout.idempotency_key),
                    aggregate_type: AGGREGATE_PAYOUT,
                    aggregate_id: &payout.id,
                    event_type: "PayoutCreated",
                    payload: json!({
                        "idempotency_key": payout.idempotency_key,
                        "amount": payout.amount.to_string(),
                        "currency": payout.amount.currency().as_str(),
                        "recipient_account": payout.recipient_account,
                    }),
                },
            )?;
            projection::apply_payout_change(txn, &payout)?;

            Ok((
                IntakeOutcome {
                    payout,
                    created: true,
                },
                vec![event],
            ))
        })?;

        if outcome.created {
            info!(
                payout_id = %outcome.payout.id,
                idempotency_key = %outcome.payout.idempotency_key,
                amount = %outcome.payout.amount,
                "payout accepted"
            );
        }
        self.publish(published);
        Ok(outcome)
    }

    /// Claims a pending payout for processing. Any other state is a no-op
    /// returning the current record, so duplicate deliveries and restarts
    /// fall through harmlessly.
    pub fn claim_for_processing(&self, payout_id: &str) -> Result<Payout> {
        let (payout, published) = self.store.with_txn(|txn| {
            let mut payout = require_payout(txn, payout_id)?;
            if payout.status != PayoutStatus::Pending {
                return Ok((payout, Vec::new()));
            }

            payout.status = PayoutStatus::Processing;
            payout.updated_at = Utc::now();
            update_payout(txn, &payout)?;

            let event = events::append_event(
                txn,
                self.allocator.as_ref(),
                NewEvent {
                    event_id: &format!("payout.processing:{}", payout.idempotency_key),
                    aggregate_type: AGGREGATE_PAYOUT,
                    aggregate_id: &payout.id,
                    event_type: "PayoutProcessingStarted",
                    payload: json!({ "idempotency_key": payout.idempotency_key }),
                },
            )?;
            projection::apply_payout_change(txn, &payout)?;
            Ok((payout, vec![event]))
        })?;

        self.publish(published);
        Ok(payout)
    }

    /// Completes a payout: creates the balanced ledger transaction, links it,
    /// and commits the `PayoutCompleted` event with the projections in the
    /// same unit. Idempotent for the same external id.
    pub fn finalize_success(&self, payout_id: &str, external_id: &str) -> Result<Payout> {
        let (payout, published) = self.store.with_txn(|txn| {
            let mut payout = require_payout(txn, payout_id)?;

            match payout.status {
                PayoutStatus::Completed => {
                    return if payout.external_payout_id.as_deref() == Some(external_id) {
                        Ok((payout, Vec::new()))
                    } else {
                        Err(PayoutError::Conflict(format!(
                            "payout {} already completed with a different external id",
                            payout.id
                        )))
                    };
                }
                PayoutStatus::Failed | PayoutStatus::Cancelled => {
                    return Err(PayoutError::IllegalTransition {
                        from: payout.status,
                        action: "complete",
                    });
                }
                PayoutStatus::Pending | PayoutStatus::Processing => {}
            }

            let transaction_id = format!("payout_{}", payout.idempotency_key);
            let created = ledger::create_balanced_transaction(
                txn,
                NewLedgerTransaction {
                    id: &transaction_id,
                    description: &format!("Payout to {}", payout.recipient_account),
                    debit_account: PAYOUT_LIABILITY_ACCOUNT_CODE,
                    debit_amount: payout.amount.clone(),
                    credit_account: CASH_ACCOUNT_CODE,
                    credit_amount: payout.amount.clone(),
                },
            )?;

            payout.status = PayoutStatus::Completed;
            payout.ledger_transaction_id = Some(transaction_id.clone());
            payout.external_payout_id = Some(external_id.to_string());
            payout.external_reference = Some(format!("ref_{external_id}"));
            payout.processed_at = Some(Utc::now());
            payout.updated_at = Utc::now();
            update_payout(txn, &payout)?;

            let event = events::append_event(
                txn,
                self.allocator.as_ref(),
                NewEvent {
                    event_id: &format!("payout.completed:{}", payout.idempotency_key),
                    aggregate_type: AGGREGATE_PAYOUT,
                    aggregate_id: &payout.id,
                    event_type: "PayoutCompleted",
                    payload: json!({
                        "idempotency_key": payout.idempotency_key,
                        "external_payout_id": external_id,
                        "ledger_transaction_id": transaction_id,
                        "debit_account": PAYOUT_LIABILITY_ACCOUNT_CODE,
                        "credit_account": CASH_ACCOUNT_CODE,
                        "amount": payout.amount.to_string(),
                    }),
                },
            )?;

            projection::apply_ledger_entries(txn, &created.entries, event.sequence_number)?;
            projection::apply_payout_change(txn, &payout)?;
            Ok((payout, vec![event]))
        })?;

        if !published.is_empty() {
            info!(
                payout_id = %payout.id,
                external_payout_id = %external_id,
                ledger_transaction_id = ?payout.ledger_transaction_id,
                "payout completed"
            );
        }
        self.publish(published);
        Ok(payout)
    }

    /// Records a provider failure. Retryable failures under the retry budget
    /// leave the payout in `Processing` for the dispatcher to retry; anything
    /// else is terminal.
    pub fn finalize_failure(
        &self,
        payout_id: &str,
        error_message: &str,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        let (outcome, published) = self.store.with_txn(|txn| {
            let mut payout = require_payout(txn, payout_id)?;
            if payout.status != PayoutStatus::Processing {
                return Err(PayoutError::IllegalTransition {
                    from: payout.status,
                    action: "fail",
                });
            }

            payout.retry_count += 1;
            payout.error_message = Some(error_message.to_string());
            payout.updated_at = Utc::now();

            let will_retry = retryable && (payout.retry_count as u32) < self.max_retries;
            let event_type = if will_retry {
                "PayoutRetryScheduled"
            } else {
                payout.status = PayoutStatus::Failed;
                payout.processed_at = Some(Utc::now());
                "PayoutFailed"
            };
            update_payout(txn, &payout)?;

            let event = events::append_event(
                txn,
                self.allocator.as_ref(),
                NewEvent {
                    event_id: &format!(
                        "payout.failed:{}:{}",
                        payout.idempotency_key, payout.retry_count
                    ),
                    aggregate_type: AGGREGATE_PAYOUT,
                    aggregate_id: &payout.id,
                    event_type,
                    payload: json!({
                        "idempotency_key": payout.idempotency_key,
                        "error": error_message,
                        "retry_count": payout.retry_count,
                    }),
                },
            )?;
            projection::apply_payout_change(txn, &payout)?;

            let outcome = if will_retry {
                FailureOutcome::RetryScheduled(payout)
            } else {
                FailureOutcome::Failed(payout)
            };
            Ok((outcome, vec![event]))
        })?;

        match &outcome {
            FailureOutcome::RetryScheduled(p) => warn!(
                payout_id = %p.id,
                retry_count = p.retry_count,
                error = %error_message,
                "payout attempt failed, retry scheduled"
            ),
            FailureOutcome::Failed(p) => warn!(
                payout_id = %p.id,
                retry_count = p.retry_count,
                error = %error_message,
                "payout terminally failed"
            ),
        }
        self.publish(published);
        Ok(outcome)
    }

    /// Cancels a payout. Permitted only while still `Pending`.
    pub fn cancel(&self, payout_id: &str) -> Result<Payout> {
        let (payout, published) = self.store.with_txn(|txn| {
            let mut payout = require_payout(txn, payout_id)?;
            if payout.status != PayoutStatus::Pending {
                return Err(PayoutError::IllegalTransition {
                    from: payout.status,
                    action: "cancel",
                });
            }

            payout.status = PayoutStatus::Cancelled;
            payout.updated_at = Utc::now();
            payout.processed_at = Some(Utc::now());
            update_payout(txn, &payout)?;

            let event = events::append_event(
                txn,
                self.allocator.as_ref(),
                NewEvent {
                    event_id: &format!("payout.cancelled:{}", payout.idempotency_key),
                    aggregate_type: AGGREGATE_PAYOUT,
                    aggregate_id: &payout.id,
                    event_type: "PayoutCancelled",
                    payload: json!({ "idempotency_key": payout.idempotency_key }),
                },
            )?;
            projection::apply_payout_change(txn, &payout)?;
            Ok((payout, vec![event]))
        })?;

        info!(payout_id = %payout.id, "payout cancelled");
        self.publish(published);
        Ok(payout)
    }

    pub fn get(&self, payout_id: &str) -> Result<Option<Payout>> {
        self.store.read(|conn| load_payout(conn, payout_id))
    }

    pub fn get_by_key(&self, idempotency_key: &str) -> Result<Option<Payout>> {
        self.store
            .read(|conn| load_payout_by_key(conn, idempotency_key))
    }

    pub fn list(
        &self,
        status: Option<PayoutStatus>,
        before: Option<(&str, &str)>,
        limit: usize,
    ) -> Result<Vec<Payout>> {
        self.store
            .read(|conn| list_payouts(conn, status, before, limit))
    }

    /// Payouts that still need a worker: everything non-terminal.
    pub fn inflight_payout_ids(&self) -> Result<Vec<String>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM payouts WHERE status IN ('PENDING', 'PROCESSING')
                 ORDER BY created_at, id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn publish(&self, events: Vec<EventRecord>) {
        // Advisory broadcast only; losing a subscriber is never an error.
        for event in events {
            let _ = self.events_tx.send(event);
        }
    }
}

fn validate_request(req: &PayoutRequest) -> Result<()> {
    if req.idempotency_key.trim().is_empty() {
        return Err(PayoutError::Validation(
            "idempotency_key is required".to_string(),
        ));
    }
    if req.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(PayoutError::Validation(format!(
            "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    if !req.amount.is_positive() {
        return Err(PayoutError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    if req.recipient_account.trim().is_empty() {
        return Err(PayoutError::Validation(
            "recipient_account is required".to_string(),
        ));
    }
    if !req.metadata.is_object() {
        return Err(PayoutError::Validation(
            "metadata must be an object".to_string(),
        ));
    }
    Ok(())
}

/// Immutable-field comparison for idempotent replay detection.
fn request_matches(existing: &Payout, req: &PayoutRequest) -> bool {
    existing.amount == req.amount
        && existing.recipient_account == req.recipient_account
        && existing.recipient_name == req.recipient_name
        && existing.description == req.description
        && existing.metadata == req.metadata
}

fn require_payout(conn: &Connection, payout_id: &str) -> Result<Payout> {
    load_payout(conn, payout_id)?
        .ok_or_else(|| PayoutError::NotFound(format!("payout {payout_id}")))
}

const PAYOUT_COLUMNS: &str = "id, idempotency_key, amount_minor, currency, recipient_account,
    recipient_name, description, metadata, status, ledger_transaction_id, external_payout_id,
    external_reference, error_message, retry_count, created_at, updated_at, processed_at";

pub fn load_payout(conn: &Connection, payout_id: &str) -> Result<Option<Payout>> {
    conn.query_row(
        &format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = ?1"),
        params![payout_id],
        payout_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn load_payout_by_key(conn: &Connection, idempotency_key: &str) -> Result<Option<Payout>> {
    conn.query_row(
        &format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE idempotency_key = ?1"),
        params![idempotency_key],
        payout_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn list_payouts(
    conn: &Connection,
    status: Option<PayoutStatus>,
    before: Option<(&str, &str)>,
    limit: usize,
) -> Result<Vec<Payout>> {
    // Keyset pagination on (created_at, id), newest first.
    let mut sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE 1=1");
    let mut args: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(status) = status {
        args.push(status.as_str().to_string().into());
        sql.push_str(&format!(" AND status = ?{}", args.len()));
    }
    if let Some((created_at, id)) = before {
        args.push(created_at.to_string().into());
        args.push(id.to_string().into());
        sql.push_str(&format!(
            " AND (created_at, id) < (?{}, ?{})",
            args.len() - 1,
            args.len()
        ));
    }
    args.push((limit as i64).into());
    sql.push_str(&format!(
        " ORDER BY created_at DESC, id DESC LIMIT ?{}",
        args.len()
    ));

    let mut stmt = conn.prepare(&sql)?;
    let payouts = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), payout_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(payouts)
}

fn insert_payout(conn: &Connection, payout: &Payout) -> Result<()> {
    conn.execute(
        "INSERT INTO payouts
             (id, idempotency_key, amount_minor, currency, recipient_account, recipient_name,
              description, metadata, status, retry_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            payout.id,
            payout.idempotency_key,
            payout.amount.minor_units(),
            payout.amount.currency().as_str(),
            payout.recipient_account,
            payout.recipient_name,
            payout.description,
            serde_json::to_string(&payout.metadata)
                .map_err(|e| PayoutError::Validation(format!("unserializable metadata: {e}")))?,
            payout.status.as_str(),
            payout.retry_count,
            ts_string(&payout.created_at),
            ts_string(&payout.updated_at),
        ],
    )?;
    Ok(())
}

/// Updates the mutable lifecycle fields. Identity and request payload
/// columns are never touched after insert.
fn update_payout(conn: &Connection, payout: &Payout) -> Result<()> {
    conn.execute(
        "UPDATE payouts SET
             status = ?2,
             ledger_transaction_id = ?3,
             external_payout_id = ?4,
             external_reference = ?5,
             error_message = ?6,
             retry_count = ?7,
             updated_at = ?8,
             processed_at = ?9
         WHERE id = ?1",
        params![
            payout.id,
            payout.status.as_str(),
            payout.ledger_transaction_id,
            payout.external_payout_id,
            payout.external_reference,
            payout.error_message,
            payout.retry_count,
            ts_string(&payout.updated_at),
            payout.processed_at.as_ref().map(ts_string),
        ],
    )?;
    Ok(())
}

fn ts_string(ts: &chrono::DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn payout_from_row(row: &Row<'_>) -> rusqlite::Result<Payout> {
    let currency_str: String = row.get(3)?;
    let metadata_json: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    Ok(Payout {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        amount: Amount::from_minor_units(
            row.get(2)?,
            Currency::new(&currency_str).unwrap_or_default(),
        ),
        recipient_account: row.get(4)?,
        recipient_name: row.get(5)?,
        description: row.get(6)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        status: PayoutStatus::parse(&status_str).unwrap_or(PayoutStatus::Pending),
        ledger_transaction_id: row.get(9)?,
        external_payout_id: row.get(10)?,
        external_reference: row.get(11)?,
        error_message: row.get(12)?,
        retry_count: row.get(13)?,
        created_at: crate::ledger::parse_ts(&row.get::<_, String>(14)?),
        updated_at: crate::ledger::parse_ts(&row.get::<_, String>(15)?),
        processed_at: row
            .get::<_, Option<String>>(16)?
            .map(|raw| crate::ledger::parse_ts(&raw)),
    })
}
