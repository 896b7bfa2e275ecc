//! End-to-end payout scenarios against a real database file.
//!
//! Covers the full pipeline: HTTP-shaped intake through the engine, worker
//! processing with the simulated provider, event ordering, and ledger /
//! read-model effects.

use payout_engine::amount::{Amount, Currency};
use payout_engine::error::PayoutError;
use payout_engine::events::GaplessCounter;
use payout_engine::ledger;
use payout_engine::models::{EventRecord, PayoutStatus};
use payout_engine::payouts::{
    Dispatcher, PayoutEngine, PayoutProvider, PayoutRequest, ProviderError, ProviderRequest,
    SimulatedProvider, WorkItem, WorkerConfig,
};
use payout_engine::projection;
use payout_engine::store::{Store, CASH_ACCOUNT_CODE, PAYOUT_LIABILITY_ACCOUNT_CODE};
use payout_engine::payouts::worker::{process_payout_once, RetryPolicy, StepOutcome};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

struct Harness {
    engine: Arc<PayoutEngine>,
    provider: Arc<SimulatedProvider>,
    _db_file: NamedTempFile,
}

fn harness(max_retries: u32) -> Harness {
    let db_file = NamedTempFile::new().unwrap();
    let store = Store::open(db_file.path().to_str().unwrap()).unwrap();
    store.bootstrap_accounts().unwrap();

    let (events_tx, _rx) = broadcast::channel::<EventRecord>(256);
    let engine = Arc::new(PayoutEngine::new(
        store,
        Arc::new(GaplessCounter),
        events_tx,
        max_retries,
    ));
    Harness {
        engine,
        provider: Arc::new(SimulatedProvider::new()),
        _db_file: db_file,
    }
}

fn request(key: &str, amount: &str) -> PayoutRequest {
    PayoutRequest {
        idempotency_key: key.to_string(),
        amount: Amount::parse(amount, Currency::usd()).unwrap(),
        recipient_account: "R".to_string(),
        recipient_name: "J".to_string(),
        description: "d".to_string(),
        metadata: json!({}),
    }
}

fn balances(engine: &PayoutEngine) -> (i64, i64) {
    engine
        .store()
        .read(|conn| {
            let cash = projection::account_balance(conn, CASH_ACCOUNT_CODE)?
                .map(|b| b.balance.minor_units())
                .unwrap_or(0);
            let liability = projection::account_balance(conn, PAYOUT_LIABILITY_ACCOUNT_CODE)?
                .map(|b| b.balance.minor_units())
                .unwrap_or(0);
            Ok((cash, liability))
        })
        .unwrap()
}

fn event_types(engine: &PayoutEngine, payout_id: &str) -> Vec<String> {
    engine
        .store()
        .read(|conn| payout_engine::events::aggregate_history(conn, "payout", payout_id))
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// S1: happy path. Intake, process, completion with ordered events and
/// balanced accounting effects.
#[tokio::test]
async fn happy_path_completes_with_ordered_events_and_balances() {
    let h = harness(3);
    let outcome = h.engine.intake(request("k1", "100.00")).unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.payout.status, PayoutStatus::Pending);

    let step = process_payout_once(
        &h.engine,
        h.provider.as_ref(),
        Duration::from_secs(1),
        &outcome.payout.id,
    )
    .await
    .unwrap();
    assert_eq!(step, StepOutcome::Done(PayoutStatus::Completed));

    let done = h.engine.get(&outcome.payout.id).unwrap().unwrap();
    assert_eq!(done.status, PayoutStatus::Completed);
    assert_eq!(done.ledger_transaction_id.as_deref(), Some("payout_k1"));
    assert!(done.external_payout_id.is_some());

    // Events are contiguous in sequence and in lifecycle order.
    let history = h
        .engine
        .store()
        .read(|conn| payout_engine::events::aggregate_history(conn, "payout", &done.id))
        .unwrap();
    let types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["PayoutCreated", "PayoutProcessingStarted", "PayoutCompleted"]
    );
    let first_seq = history[0].sequence_number;
    assert_eq!(history[1].sequence_number, first_seq + 1);
    assert_eq!(history[2].sequence_number, first_seq + 2);

    // Cash down 100.00, payout liability down 100.00.
    let (cash, liability) = balances(&h.engine);
    assert_eq!(cash, -10_000);
    assert_eq!(liability, -10_000);
}

/// S2: five concurrent submissions of the same request yield one payout row,
/// one PayoutCreated event, and the same id in every response.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_idempotent_intake_creates_one_payout() {
    let h = harness(3);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = h.engine.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            engine.intake(request("k1", "100.00"))
        }));
    }

    let mut ids = Vec::new();
    let mut created_count = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.created {
            created_count += 1;
        }
        ids.push(outcome.payout.id);
    }

    assert_eq!(created_count, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let rows: i64 = h
        .engine
        .store()
        .read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM payouts", [], |r| r.get(0))
                .map_err(PayoutError::Storage)
        })
        .unwrap();
    assert_eq!(rows, 1);

    let created_events: i64 = h
        .engine
        .store()
        .read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM events WHERE event_type = 'PayoutCreated'",
                [],
                |r| r.get(0),
            )
            .map_err(PayoutError::Storage)
        })
        .unwrap();
    assert_eq!(created_events, 1);
}

/// S3: same key with a different amount is rejected without any new rows or
/// events.
#[tokio::test]
async fn conflicting_replay_is_rejected_without_side_effects() {
    let h = harness(3);
    h.engine.intake(request("k1", "100.00")).unwrap();

    let events_before: i64 = h
        .engine
        .store()
        .read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
                .map_err(PayoutError::Storage)
        })
        .unwrap();

    let result = h.engine.intake(request("k1", "200.00"));
    assert!(matches!(result, Err(PayoutError::IdempotencyConflict)));

    let events_after: i64 = h
        .engine
        .store()
        .read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
                .map_err(PayoutError::Storage)
        })
        .unwrap();
    assert_eq!(events_before, events_after);
}

/// S4: two transient provider failures, then success. Retry count lands at
/// two, the retry events precede completion, and exactly one ledger
/// transaction exists.
#[tokio::test]
async fn transient_failures_then_success() {
    let h = harness(5);
    h.provider
        .push_failure(ProviderError::Transient("edge blip".to_string()));
    h.provider
        .push_failure(ProviderError::Transient("edge blip".to_string()));

    let payout = h.engine.intake(request("k4", "75.00")).unwrap().payout;

    let mut steps = Vec::new();
    loop {
        let step = process_payout_once(
            &h.engine,
            h.provider.as_ref(),
            Duration::from_secs(1),
            &payout.id,
        )
        .await
        .unwrap();
        let done = matches!(step, StepOutcome::Done(_));
        steps.push(step);
        if done {
            break;
        }
    }
    assert_eq!(steps.len(), 3);

    let done = h.engine.get(&payout.id).unwrap().unwrap();
    assert_eq!(done.status, PayoutStatus::Completed);
    assert_eq!(done.retry_count, 2);

    assert_eq!(
        event_types(&h.engine, &payout.id),
        vec![
            "PayoutCreated",
            "PayoutProcessingStarted",
            "PayoutRetryScheduled",
            "PayoutRetryScheduled",
            "PayoutCompleted",
        ]
    );

    let ledger_txns: i64 = h
        .engine
        .store()
        .read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM ledger_transactions", [], |r| r.get(0))
                .map_err(PayoutError::Storage)
        })
        .unwrap();
    assert_eq!(ledger_txns, 1);
}

/// S5: a permanent provider failure ends in Failed with untouched balances
/// and no ledger transaction under the payout's deterministic id.
#[tokio::test]
async fn permanent_failure_leaves_balances_untouched() {
    let h = harness(3);
    h.provider
        .push_failure(ProviderError::Permanent("recipient blocked".to_string()));

    let payout = h.engine.intake(request("k5", "75.00")).unwrap().payout;
    let step = process_payout_once(
        &h.engine,
        h.provider.as_ref(),
        Duration::from_secs(1),
        &payout.id,
    )
    .await
    .unwrap();
    assert_eq!(step, StepOutcome::Done(PayoutStatus::Failed));

    let done = h.engine.get(&payout.id).unwrap().unwrap();
    assert_eq!(done.status, PayoutStatus::Failed);
    assert!(done.error_message.is_some());

    h.engine
        .store()
        .read(|conn| {
            assert!(ledger::get_transaction(conn, "payout_k5")?.is_none());
            Ok(())
        })
        .unwrap();

    assert_eq!(balances(&h.engine), (0, 0));
    assert!(event_types(&h.engine, &payout.id).contains(&"PayoutFailed".to_string()));
}

/// S6: worker dies between the provider call and finalize. The restarted
/// worker re-calls the provider with the same idempotency key, receives the
/// same external id, and completes exactly once.
#[tokio::test]
async fn crash_recovery_reaches_completed_exactly_once() {
    let h = harness(3);
    let payout = h.engine.intake(request("k6", "50.00")).unwrap().payout;

    // First worker: claim, provider call, then crash before finalizing.
    let claimed = h.engine.claim_for_processing(&payout.id).unwrap();
    assert_eq!(claimed.status, PayoutStatus::Processing);
    let receipt = h
        .provider
        .create_payout(&ProviderRequest {
            idempotency_key: claimed.idempotency_key.clone(),
            amount: claimed.amount.clone(),
            recipient_account: claimed.recipient_account.clone(),
            recipient_name: claimed.recipient_name.clone(),
        })
        .await
        .unwrap();

    // Restart: recovery finds the Processing payout and the unit reruns.
    let inflight = h.engine.inflight_payout_ids().unwrap();
    assert_eq!(inflight, vec![payout.id.clone()]);

    let step = process_payout_once(
        &h.engine,
        h.provider.as_ref(),
        Duration::from_secs(1),
        &payout.id,
    )
    .await
    .unwrap();
    assert_eq!(step, StepOutcome::Done(PayoutStatus::Completed));

    let done = h.engine.get(&payout.id).unwrap().unwrap();
    assert_eq!(
        done.external_payout_id.as_deref(),
        Some(receipt.external_id.as_str())
    );
    assert_eq!(h.provider.completed_count(), 1);

    let ledger_txns: i64 = h
        .engine
        .store()
        .read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM ledger_transactions", [], |r| r.get(0))
                .map_err(PayoutError::Storage)
        })
        .unwrap();
    assert_eq!(ledger_txns, 1);
}

/// Full pipeline through the dispatcher with several payouts in flight,
/// then a rebuild that must reproduce the projected state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_pipeline_and_rebuild_agree() {
    let h = harness(3);
    let provider: Arc<dyn PayoutProvider> = h.provider.clone();
    let dispatcher = Dispatcher::spawn(
        h.engine.clone(),
        provider,
        WorkerConfig {
            worker_count: 3,
            queue_capacity: 64,
            retry_policy: RetryPolicy {
                base: Duration::from_millis(10),
                factor: 2,
                cap: Duration::from_millis(50),
            },
            provider_timeout: Duration::from_secs(1),
        },
    );

    let mut ids = Vec::new();
    for i in 0..5 {
        let payout = h
            .engine
            .intake(request(&format!("batch-{i}"), "10.00"))
            .unwrap()
            .payout;
        dispatcher
            .enqueue(WorkItem::ProcessPayout {
                payout_id: payout.id.clone(),
            })
            .await;
        ids.push(payout.id);
    }

    for id in &ids {
        let mut status = PayoutStatus::Pending;
        for _ in 0..200 {
            status = h.engine.get(id).unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, PayoutStatus::Completed);
    }
    dispatcher.shutdown().await;

    // Five completed payouts at 10.00 each.
    assert_eq!(balances(&h.engine), (-5_000, -5_000));

    let (balances_before, payout_rows_before, txn_rows_before) = h
        .engine
        .store()
        .read(|conn| {
            Ok((
                projection::all_account_balances(conn)?,
                projection::all_payout_summaries(conn)?,
                projection::all_transaction_summaries(conn)?,
            ))
        })
        .unwrap();

    h.engine
        .store()
        .with_txn(|txn| projection::rebuild(txn))
        .unwrap();

    let (balances_after, payout_rows_after, txn_rows_after) = h
        .engine
        .store()
        .read(|conn| {
            Ok((
                projection::all_account_balances(conn)?,
                projection::all_payout_summaries(conn)?,
                projection::all_transaction_summaries(conn)?,
            ))
        })
        .unwrap();

    assert_eq!(balances_before, balances_after);
    assert_eq!(payout_rows_before, payout_rows_after);
    assert_eq!(txn_rows_before, txn_rows_after);
}

/// Event sequence numbers over a mixed history are exactly 1..N.
#[tokio::test]
async fn event_log_is_dense_over_mixed_history() {
    let h = harness(2);

    // One success, one permanent failure, one cancellation.
    let ok = h.engine.intake(request("mix-ok", "10.00")).unwrap().payout;
    process_payout_once(&h.engine, h.provider.as_ref(), Duration::from_secs(1), &ok.id)
        .await
        .unwrap();

    h.provider
        .push_failure(ProviderError::Permanent("no".to_string()));
    let bad = h.engine.intake(request("mix-bad", "10.00")).unwrap().payout;
    process_payout_once(&h.engine, h.provider.as_ref(), Duration::from_secs(1), &bad.id)
        .await
        .unwrap();

    let cancelled = h
        .engine
        .intake(request("mix-cancel", "10.00"))
        .unwrap()
        .payout;
    h.engine.cancel(&cancelled.id).unwrap();

    let events = h
        .engine
        .store()
        .read(|conn| payout_engine::events::events_since(conn, 0, 1000))
        .unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.sequence_number).collect();
    let expected: Vec<i64> = (1..=seqs.len() as i64).collect();
    assert_eq!(seqs, expected);
}
