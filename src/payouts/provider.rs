//! External payout provider contract.
//!
//! The provider deduplicates by idempotency key: retrying a call with the
//! same key must return the same external id, never move money twice. The
//! engine relies on that contract to survive crashes between the provider
//! call and the local finalize.

use crate::amount::Amount;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub idempotency_key: String,
    pub amount: Amount,
    pub recipient_account: String,
    pub recipient_name: String,
}

#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    pub external_id: String,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The call may succeed if retried (network trouble, 5xx, timeout).
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The call will never succeed (rejected recipient, 4xx).
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn create_payout(
        &self,
        req: &ProviderRequest,
    ) -> Result<ProviderReceipt, ProviderError>;
}

/// Real provider behind an HTTP endpoint.
pub struct HttpPayoutProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct HttpPayoutResponse {
    external_id: String,
}

impl HttpPayoutProvider {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl PayoutProvider for HttpPayoutProvider {
    async fn create_payout(
        &self,
        req: &ProviderRequest,
    ) -> Result<ProviderReceipt, ProviderError> {
        let url = format!("{}/payouts", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", &req.idempotency_key)
            .json(&serde_json::json!({
                "idempotency_key": req.idempotency_key,
                "amount": req.amount.to_string(),
                "currency": req.amount.currency().as_str(),
                "recipient_account": req.recipient_account,
                "recipient_name": req.recipient_name,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ProviderError::Transient(format!(
                "provider returned {status}"
            )));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Permanent(format!(
                "provider returned {status}: {body}"
            )));
        }

        let body: HttpPayoutResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed provider response: {e}")))?;
        Ok(ProviderReceipt {
            external_id: body.external_id,
        })
    }
}

#[derive(Default)]
struct SimulatedState {
    /// Key → external id issued on first success. Replays return the same id.
    completed: HashMap<String, String>,
    /// Failures to inject before the next success, oldest first.
    scripted_failures: VecDeque<ProviderError>,
    calls: u64,
}

/// In-memory provider for local runs and tests. Honors the idempotency
/// contract and lets tests script failure sequences.
#[derive(Default)]
pub struct SimulatedProvider {
    state: Mutex<SimulatedState>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure returned by the next call (before dedup lookup of
    /// new keys; already-completed keys still replay their receipt).
    pub fn push_failure(&self, error: ProviderError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.len()
    }
}

#[async_trait]
impl PayoutProvider for SimulatedProvider {
    async fn create_payout(
        &self,
        req: &ProviderRequest,
    ) -> Result<ProviderReceipt, ProviderError> {
        let mut state = self.state.lock();
        state.calls += 1;

        if let Some(external_id) = state.completed.get(&req.idempotency_key) {
            debug!(
                idempotency_key = %req.idempotency_key,
                external_id = %external_id,
                "simulated provider deduplicated payout"
            );
            return Ok(ProviderReceipt {
                external_id: external_id.clone(),
            });
        }

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        let external_id = format!("ext_{}_{}", req.idempotency_key, Uuid::new_v4());
        state
            .completed
            .insert(req.idempotency_key.clone(), external_id.clone());
        Ok(ProviderReceipt { external_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Currency;

    fn request(key: &str) -> ProviderRequest {
        ProviderRequest {
            idempotency_key: key.to_string(),
            amount: Amount::parse("10.00", Currency::usd()).unwrap(),
            recipient_account: "acct".to_string(),
            recipient_name: "J".to_string(),
        }
    }

    #[tokio::test]
    async fn simulated_provider_deduplicates_by_key() {
        let provider = SimulatedProvider::new();
        let first = provider.create_payout(&request("k1")).await.unwrap();
        let replay = provider.create_payout(&request("k1")).await.unwrap();
        assert_eq!(first.external_id, replay.external_id);
        assert_eq!(provider.completed_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_fire_in_order_then_succeed() {
        let provider = SimulatedProvider::new();
        provider.push_failure(ProviderError::Transient("blip".to_string()));
        provider.push_failure(ProviderError::Transient("blip again".to_string()));

        assert!(provider.create_payout(&request("k1")).await.is_err());
        assert!(provider.create_payout(&request("k1")).await.is_err());
        assert!(provider.create_payout(&request("k1")).await.is_ok());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_transient() {
        let provider = SimulatedProvider::new();
        provider.push_failure(ProviderError::Permanent("closed account".to_string()));
        let err = provider.create_payout(&request("k1")).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
