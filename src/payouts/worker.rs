//! Worker dispatcher.
//!
//! Work units are delivered at least once over a shared queue and consumed
//! by a pool of tasks. Each unit is idempotent on its key, so duplicate
//! deliveries, restarts and concurrent workers are all safe. Failed provider
//! calls retry with bounded exponential backoff until the state machine
//! declares the payout terminal.

use crate::error::PayoutError;
use crate::models::PayoutStatus;
use crate::payouts::provider::{PayoutProvider, ProviderError, ProviderRequest};
use crate::payouts::state_machine::{FailureOutcome, PayoutEngine};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A unit of work with a stable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    ProcessPayout { payout_id: String },
}

impl WorkItem {
    pub fn key(&self) -> String {
        match self {
            WorkItem::ProcessPayout { payout_id } => format!("process_payout:{payout_id}"),
        }
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped, with up to
    /// 10% jitter so synchronized workers fan out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.min(16));
        let raw = self.base.saturating_mul(exp);
        let capped = raw.min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        capped.mul_f64(1.0 + jitter)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub retry_policy: RetryPolicy,
    pub provider_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
            retry_policy: RetryPolicy::default(),
            provider_timeout: Duration::from_secs(10),
        }
    }
}

/// What one processing attempt decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Payout reached a terminal state (or already was terminal).
    Done(PayoutStatus),
    /// Transient failure recorded; the unit should run again after backoff.
    Retry,
}

/// One attempt at driving a payout forward: claim, call the provider with a
/// deadline, finalize. Idempotent on the payout id; safe to run any number
/// of times in any interleaving.
pub async fn process_payout_once(
    engine: &PayoutEngine,
    provider: &dyn PayoutProvider,
    provider_timeout: Duration,
    payout_id: &str,
) -> Result<StepOutcome, PayoutError> {
    let payout = engine.claim_for_processing(payout_id)?;
    if payout.status != PayoutStatus::Processing {
        debug!(payout_id, status = %payout.status, "payout already terminal, nothing to do");
        return Ok(StepOutcome::Done(payout.status));
    }

    let request = ProviderRequest {
        idempotency_key: payout.idempotency_key.clone(),
        amount: payout.amount.clone(),
        recipient_account: payout.recipient_account.clone(),
        recipient_name: payout.recipient_name.clone(),
    };

    let result = match tokio::time::timeout(provider_timeout, provider.create_payout(&request))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Transient(format!(
            "provider call exceeded {}ms deadline",
            provider_timeout.as_millis()
        ))),
    };

    match result {
        Ok(receipt) => {
            let done = engine.finalize_success(payout_id, &receipt.external_id)?;
            Ok(StepOutcome::Done(done.status))
        }
        Err(err) => {
            let retryable = err.is_transient();
            match engine.finalize_failure(payout_id, &err.to_string(), retryable)? {
                FailureOutcome::RetryScheduled(_) => Ok(StepOutcome::Retry),
                FailureOutcome::Failed(p) => Ok(StepOutcome::Done(p.status)),
            }
        }
    }
}

/// Shared work queue plus its worker pool.
pub struct Dispatcher {
    queue_tx: mpsc::Sender<WorkItem>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(
        engine: Arc<PayoutEngine>,
        provider: Arc<dyn PayoutProvider>,
        config: WorkerConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let engine = engine.clone();
            let provider = provider.clone();
            let queue_rx = queue_rx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let policy = config.retry_policy.clone();
            let provider_timeout = config.provider_timeout;
            handles.push(tokio::spawn(async move {
                worker_loop(
                    worker_id,
                    engine,
                    provider,
                    queue_rx,
                    shutdown_rx,
                    policy,
                    provider_timeout,
                )
                .await;
            }));
        }

        info!(workers = config.worker_count, "payout dispatcher started");
        Self {
            queue_tx,
            shutdown_tx,
            handles,
        }
    }

    /// Queue handle for producers (API intake, recovery).
    pub fn queue(&self) -> mpsc::Sender<WorkItem> {
        self.queue_tx.clone()
    }

    pub async fn enqueue(&self, item: WorkItem) {
        if let Err(e) = self.queue_tx.send(item).await {
            // Startup recovery will pick the payout up on next boot.
            warn!(error = %e, "work queue closed, dropping enqueue");
        }
    }

    /// Re-enqueues every payout that has not reached a terminal state.
    /// Run at startup; delivery is at-least-once, duplicates are harmless.
    pub async fn recover_inflight(&self, engine: &PayoutEngine) -> Result<usize, PayoutError> {
        let ids = engine.inflight_payout_ids()?;
        let count = ids.len();
        for payout_id in ids {
            self.enqueue(WorkItem::ProcessPayout { payout_id }).await;
        }
        if count > 0 {
            info!(count, "recovered in-flight payouts onto the work queue");
        }
        Ok(count)
    }

    /// Cooperative shutdown: workers stop claiming new units and finish the
    /// step they are on.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        drop(self.queue_tx);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("payout dispatcher drained");
    }
}

async fn worker_loop(
    worker_id: usize,
    engine: Arc<PayoutEngine>,
    provider: Arc<dyn PayoutProvider>,
    queue_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    policy: RetryPolicy,
    provider_timeout: Duration,
) {
    debug!(worker_id, "worker started");
    loop {
        let item = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else {
            break;
        };

        run_work_item(
            &engine,
            provider.as_ref(),
            &policy,
            provider_timeout,
            &mut shutdown_rx,
            &item,
        )
        .await;
    }
    debug!(worker_id, "worker stopped");
}

/// Runs one work unit to a terminal decision, backing off between transient
/// failures. Unexpected storage errors count against the same retry budget
/// so a broken unit cannot spin forever.
async fn run_work_item(
    engine: &PayoutEngine,
    provider: &dyn PayoutProvider,
    policy: &RetryPolicy,
    provider_timeout: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
    item: &WorkItem,
) {
    let WorkItem::ProcessPayout { payout_id } = item;
    let mut attempt: u32 = 0;
    let max_attempts = engine.max_retries().max(1);

    loop {
        match process_payout_once(engine, provider, provider_timeout, payout_id).await {
            Ok(StepOutcome::Done(status)) => {
                debug!(key = %item.key(), status = %status, "work unit finished");
                return;
            }
            Ok(StepOutcome::Retry) => {}
            Err(e) => {
                error!(key = %item.key(), error = %e, "work unit error");
                if attempt + 1 >= max_attempts {
                    return;
                }
            }
        }

        if *shutdown_rx.borrow() {
            // Leave the payout in Processing; recovery re-enqueues it.
            warn!(key = %item.key(), "shutdown requested, abandoning retries");
            return;
        }
        let delay = policy.delay(attempt);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{Amount, Currency};
    use crate::events::GaplessCounter;
    use crate::payouts::provider::SimulatedProvider;
    use crate::payouts::state_machine::PayoutRequest;
    use crate::store::Store;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn engine() -> Arc<PayoutEngine> {
        let store = Store::open_in_memory().unwrap();
        store.bootstrap_accounts().unwrap();
        let (tx, _rx) = broadcast::channel(64);
        Arc::new(PayoutEngine::new(store, Arc::new(GaplessCounter), tx, 3))
    }

    fn request(key: &str) -> PayoutRequest {
        PayoutRequest {
            idempotency_key: key.to_string(),
            amount: Amount::parse("25.00", Currency::usd()).unwrap(),
            recipient_account: "acct".to_string(),
            recipient_name: "J".to_string(),
            description: String::new(),
            metadata: json!({}),
        }
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_millis(450),
        };
        // Jitter adds at most 10%.
        assert!(policy.delay(0) >= Duration::from_millis(100));
        assert!(policy.delay(0) <= Duration::from_millis(110));
        assert!(policy.delay(1) >= Duration::from_millis(200));
        assert!(policy.delay(10) <= Duration::from_millis(495));
    }

    #[tokio::test]
    async fn happy_path_completes_payout() {
        let engine = engine();
        let provider = SimulatedProvider::new();
        let payout = engine.intake(request("k1")).unwrap().payout;

        let outcome =
            process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                .await
                .unwrap();
        assert_eq!(outcome, StepOutcome::Done(PayoutStatus::Completed));

        let done = engine.get(&payout.id).unwrap().unwrap();
        assert!(done.external_payout_id.is_some());
        assert_eq!(done.ledger_transaction_id.as_deref(), Some("payout_k1"));
    }

    #[tokio::test]
    async fn duplicate_deliveries_complete_exactly_once() {
        let engine = engine();
        let provider = SimulatedProvider::new();
        let payout = engine.intake(request("k1")).unwrap().payout;

        for _ in 0..3 {
            let outcome =
                process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                    .await
                    .unwrap();
            assert_eq!(outcome, StepOutcome::Done(PayoutStatus::Completed));
        }

        assert_eq!(provider.completed_count(), 1);
        let count: i64 = engine
            .store()
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM ledger_transactions", [], |r| r.get(0))
                    .map_err(PayoutError::Storage)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let engine = engine();
        let provider = SimulatedProvider::new();
        provider.push_failure(ProviderError::Transient("blip 1".to_string()));
        provider.push_failure(ProviderError::Transient("blip 2".to_string()));
        let payout = engine.intake(request("k1")).unwrap().payout;

        let first =
            process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                .await
                .unwrap();
        assert_eq!(first, StepOutcome::Retry);

        let second =
            process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                .await
                .unwrap();
        assert_eq!(second, StepOutcome::Retry);

        let third =
            process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                .await
                .unwrap();
        assert_eq!(third, StepOutcome::Done(PayoutStatus::Completed));

        let done = engine.get(&payout.id).unwrap().unwrap();
        assert_eq!(done.retry_count, 2);
    }

    #[tokio::test]
    async fn permanent_failure_leaves_no_ledger_trace() {
        let engine = engine();
        let provider = SimulatedProvider::new();
        provider.push_failure(ProviderError::Permanent("account closed".to_string()));
        let payout = engine.intake(request("k1")).unwrap().payout;

        let outcome =
            process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                .await
                .unwrap();
        assert_eq!(outcome, StepOutcome::Done(PayoutStatus::Failed));

        engine
            .store()
            .read(|conn| {
                assert!(crate::ledger::get_transaction(conn, "payout_k1")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn crash_between_provider_call_and_finalize_recovers_exactly_once() {
        let engine = engine();
        let provider = SimulatedProvider::new();
        let payout = engine.intake(request("k1")).unwrap().payout;

        // Simulated crash: the worker claimed the payout and reached the
        // provider, then died before finalizing.
        let claimed = engine.claim_for_processing(&payout.id).unwrap();
        let receipt = provider
            .create_payout(&ProviderRequest {
                idempotency_key: claimed.idempotency_key.clone(),
                amount: claimed.amount.clone(),
                recipient_account: claimed.recipient_account.clone(),
                recipient_name: claimed.recipient_name.clone(),
            })
            .await
            .unwrap();

        // Restarted worker runs the whole unit again.
        let outcome =
            process_payout_once(&engine, &provider, Duration::from_secs(1), &payout.id)
                .await
                .unwrap();
        assert_eq!(outcome, StepOutcome::Done(PayoutStatus::Completed));

        // The provider deduplicated: same external id, one ledger transaction.
        let done = engine.get(&payout.id).unwrap().unwrap();
        assert_eq!(done.external_payout_id.as_deref(), Some(receipt.external_id.as_str()));
        assert_eq!(provider.completed_count(), 1);

        let count: i64 = engine
            .store()
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM ledger_transactions", [], |r| r.get(0))
                    .map_err(PayoutError::Storage)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dispatcher_processes_queued_work() {
        let engine = engine();
        let provider: Arc<dyn PayoutProvider> = Arc::new(SimulatedProvider::new());
        let dispatcher = Dispatcher::spawn(
            engine.clone(),
            provider,
            WorkerConfig {
                worker_count: 2,
                ..Default::default()
            },
        );

        let payout = engine.intake(request("k1")).unwrap().payout;
        dispatcher
            .enqueue(WorkItem::ProcessPayout {
                payout_id: payout.id.clone(),
            })
            .await;

        // Poll until the workers drive it to completion.
        let mut status = PayoutStatus::Pending;
        for _ in 0..100 {
            status = engine.get(&payout.id).unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, PayoutStatus::Completed);

        dispatcher.shutdown().await;
    }
}
