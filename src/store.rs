//! SQLite-backed store.
//!
//! One connection behind a mutex; every multi-row write runs inside a
//! `BEGIN IMMEDIATE` transaction obtained through [`Store::with_txn`]. The
//! connection mutex plus the immediate transaction is the single lock token
//! for all state transitions: whoever holds it owns the payout row, the
//! sequence counter, and the projection rows for the duration of the unit.

use crate::error::{PayoutError, Result};
use crate::models::{Account, AccountKind};
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const CASH_ACCOUNT_CODE: &str = "CASH_001";
pub const PAYOUT_LIABILITY_ACCOUNT_CODE: &str = "PAYOUT_LIABILITY_001";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    normal_side TEXT NOT NULL CHECK (normal_side IN ('DEBIT', 'CREDIT')),
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ledger_transactions (
    id TEXT PRIMARY KEY CHECK (id <> ''),
    description TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY,
    transaction_id TEXT NOT NULL REFERENCES ledger_transactions(id),
    account_id TEXT NOT NULL REFERENCES accounts(id),
    side TEXT NOT NULL CHECK (side IN ('DEBIT', 'CREDIT')),
    amount_minor INTEGER NOT NULL CHECK (amount_minor >= 0),
    currency TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_created
    ON ledger_entries(account_id, created_at, id);

CREATE INDEX IF NOT EXISTS idx_ledger_entries_txn_created
    ON ledger_entries(transaction_id, created_at);

CREATE TABLE IF NOT EXISTS events (
    sequence_number INTEGER PRIMARY KEY CHECK (sequence_number > 0),
    event_id TEXT NOT NULL UNIQUE CHECK (event_id <> ''),
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_aggregate
    ON events(aggregate_type, aggregate_id, sequence_number);

-- Gapless sequence allocator. The single row is locked by the writing
-- transaction, so an abort rolls the increment back and committed sequence
-- numbers stay dense.
CREATE TABLE IF NOT EXISTS event_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
    id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE CHECK (idempotency_key <> ''),
    amount_minor INTEGER NOT NULL CHECK (amount_minor > 0),
    currency TEXT NOT NULL,
    recipient_account TEXT NOT NULL,
    recipient_name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL CHECK (status IN ('PENDING','PROCESSING','COMPLETED','FAILED','CANCELLED')),
    ledger_transaction_id TEXT,
    external_payout_id TEXT,
    external_reference TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processed_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_payouts_status_created ON payouts(status, created_at);
CREATE INDEX IF NOT EXISTS idx_payouts_created ON payouts(created_at, id);

CREATE TABLE IF NOT EXISTS account_balances (
    account_id TEXT PRIMARY KEY REFERENCES accounts(id),
    balance_minor INTEGER NOT NULL,
    debit_minus_credit_minor INTEGER NOT NULL,
    currency TEXT NOT NULL,
    as_of_sequence INTEGER NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS payout_summaries (
    payout_id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    currency TEXT NOT NULL,
    recipient_account TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    processed_at TEXT,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_payout_summaries_status
    ON payout_summaries(status, created_at);

CREATE TABLE IF NOT EXISTS ledger_transaction_summaries (
    transaction_id TEXT PRIMARY KEY,
    debit_account TEXT NOT NULL,
    credit_account TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    currency TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// RFC-3339 timestamp with fixed precision so lexicographic order matches
/// chronological order in cursor queries.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {}", db_path))?;

        Self::init(conn, Some(db_path))
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, db_path: Option<&str>) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        // Seed the sequence counter exactly once.
        conn.execute(
            "INSERT OR IGNORE INTO event_sequence (id, value) VALUES (1, 0)",
            [],
        )?;

        if let Some(path) = db_path {
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap_or_default();
            if journal_mode.to_lowercase() != "wal" {
                warn!("WAL mode not active, journal_mode = {}", journal_mode);
            }
            info!("ledger database initialized at: {}", path);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside one atomic unit (`BEGIN IMMEDIATE`). Commits on `Ok`,
    /// rolls back on `Err`; a rolled-back unit leaves no trace, including the
    /// sequence counter increment.
    pub fn with_txn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(PayoutError::Storage)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(PayoutError::Storage)?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back; make it explicit.
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    /// Read-only access on the shared connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Creates the two accounts every deployment requires. Idempotent.
    pub fn bootstrap_accounts(&self) -> Result<Vec<Account>> {
        let seed = [
            (CASH_ACCOUNT_CODE, "Cash Account", AccountKind::Asset),
            (
                PAYOUT_LIABILITY_ACCOUNT_CODE,
                "Payout Liability Account",
                AccountKind::Liability,
            ),
        ];

        self.with_txn(|txn| {
            let mut created = Vec::new();
            for (code, name, kind) in seed {
                let existing: Option<String> = txn
                    .query_row(
                        "SELECT id FROM accounts WHERE code = ?1",
                        params![code],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(ignore_no_rows)?;
                if existing.is_some() {
                    continue;
                }

                let account = Account {
                    id: Uuid::new_v4().to_string(),
                    code: code.to_string(),
                    name: name.to_string(),
                    kind,
                    normal_side: kind.normal_side(),
                    created_at: Utc::now(),
                };
                txn.execute(
                    "INSERT INTO accounts (id, code, name, kind, normal_side, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        account.id,
                        account.code,
                        account.name,
                        account.kind.as_str(),
                        account.normal_side.as_str(),
                        now_rfc3339(),
                    ],
                )?;
                info!(code = account.code, "bootstrap account created");
                created.push(account);
            }
            Ok(created)
        })
    }
}

/// Maps `QueryReturnedNoRows` to `Ok(None)`, everything else through.
pub fn ignore_no_rows<T>(err: rusqlite::Error) -> std::result::Result<Option<T>, PayoutError> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(PayoutError::Storage(other)),
    }
}
