//! Domain records shared across the ledger, event log, projections and the
//! payout state machine.

use crate::amount::Amount;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Account classification. Determines which side increases the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Asset => "ASSET",
            AccountKind::Liability => "LIABILITY",
            AccountKind::Equity => "EQUITY",
            AccountKind::Revenue => "REVENUE",
            AccountKind::Expense => "EXPENSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ASSET" => Some(AccountKind::Asset),
            "LIABILITY" => Some(AccountKind::Liability),
            "EQUITY" => Some(AccountKind::Equity),
            "REVENUE" => Some(AccountKind::Revenue),
            "EXPENSE" => Some(AccountKind::Expense),
            _ => None,
        }
    }

    /// The side on which accounts of this kind increase.
    pub fn normal_side(&self) -> EntrySide {
        match self {
            AccountKind::Asset | AccountKind::Expense => EntrySide::Debit,
            AccountKind::Liability | AccountKind::Equity | AccountKind::Revenue => {
                EntrySide::Credit
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrySide {
    Debit,
    Credit,
}

impl EntrySide {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntrySide::Debit => "DEBIT",
            EntrySide::Credit => "CREDIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBIT" => Some(EntrySide::Debit),
            "CREDIT" => Some(EntrySide::Credit),
            _ => None,
        }
    }
}

/// An account in the ledger. Immutable after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub code: String,
    pub name: String,
    pub kind: AccountKind,
    pub normal_side: EntrySide,
    pub created_at: DateTime<Utc>,
}

/// Transaction header. Exists only together with its two entries.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A single immutable ledger entry. No update or delete path exists.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub transaction_id: String,
    pub account_id: String,
    pub side: EntrySide,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

/// A committed event in the global ordered log.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub sequence_number: i64,
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Processing => "PROCESSING",
            PayoutStatus::Completed => "COMPLETED",
            PayoutStatus::Failed => "FAILED",
            PayoutStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PayoutStatus::Pending),
            "PROCESSING" => Some(PayoutStatus::Processing),
            "COMPLETED" => Some(PayoutStatus::Completed),
            "FAILED" => Some(PayoutStatus::Failed),
            "CANCELLED" => Some(PayoutStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Completed | PayoutStatus::Failed | PayoutStatus::Cancelled
        )
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payout request record, driven only through the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub id: String,
    pub idempotency_key: String,
    pub amount: Amount,
    pub recipient_account: String,
    pub recipient_name: String,
    pub description: String,
    pub metadata: Value,
    pub status: PayoutStatus,
    pub ledger_transaction_id: Option<String>,
    pub external_payout_id: Option<String>,
    pub external_reference: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Projected per-account balance row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalanceRow {
    pub account_id: String,
    /// Presentation-correct signed balance (normal-side signing).
    pub balance: Amount,
    /// Raw debit-minus-credit sum, kept for audit.
    pub debit_minus_credit: Amount,
    pub as_of_sequence: i64,
}

/// Projected payout summary row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutSummaryRow {
    pub payout_id: String,
    pub idempotency_key: String,
    pub amount: Amount,
    pub recipient_account: String,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Projected ledger transaction summary row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSummaryRow {
    pub transaction_id: String,
    pub debit_account: String,
    pub credit_account: String,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}
