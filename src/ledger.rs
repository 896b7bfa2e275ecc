//! Double-entry ledger core.
//!
//! Transactions carry exactly two entries that balance to the cent. Entries
//! are insert-only; nothing in this crate updates or deletes a committed
//! entry or transaction header. Balance queries run as a single aggregation,
//! never by loading entries into memory.
//!
//! All write functions take a connection that is already inside an atomic
//! unit ([`crate::store::Store::with_txn`]).

use crate::amount::{Amount, Currency};
use crate::error::{PayoutError, Result};
use crate::models::{Account, AccountKind, EntrySide, LedgerEntry, LedgerTransaction};
use crate::store::{ignore_no_rows, now_rfc3339};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Request for one balanced transaction: a debit leg and a credit leg.
#[derive(Debug, Clone)]
pub struct NewLedgerTransaction<'a> {
    pub id: &'a str,
    pub description: &'a str,
    pub debit_account: &'a str,
    pub debit_amount: Amount,
    pub credit_account: &'a str,
    pub credit_amount: Amount,
}

/// A committed transaction with its two entries, debit leg first.
#[derive(Debug, Clone)]
pub struct CreatedTransaction {
    pub transaction: LedgerTransaction,
    pub entries: Vec<LedgerEntry>,
}

/// Creates a balanced two-entry transaction.
///
/// Idempotent on `id`: re-submitting the same id with an identical payload
/// returns the stored transaction; the same id with a different payload is a
/// conflict.
pub fn create_balanced_transaction(
    conn: &Connection,
    req: NewLedgerTransaction<'_>,
) -> Result<CreatedTransaction> {
    if !req.debit_amount.is_positive() || !req.credit_amount.is_positive() {
        return Err(PayoutError::NonPositiveAmount);
    }
    if req.debit_amount != req.credit_amount {
        return Err(PayoutError::Unbalanced);
    }
    if req.id.is_empty() {
        return Err(PayoutError::Validation(
            "transaction id must not be empty".to_string(),
        ));
    }

    let debit_account = get_account_by_code(conn, req.debit_account)?
        .ok_or_else(|| PayoutError::UnknownAccount(req.debit_account.to_string()))?;
    let credit_account = get_account_by_code(conn, req.credit_account)?
        .ok_or_else(|| PayoutError::UnknownAccount(req.credit_account.to_string()))?;

    if let Some(existing) = get_transaction(conn, req.id)? {
        return replay_or_conflict(existing, &req, &debit_account, &credit_account);
    }

    let created_at = now_rfc3339();
    conn.execute(
        "INSERT INTO ledger_transactions (id, description, created_at) VALUES (?1, ?2, ?3)",
        params![req.id, req.description, created_at],
    )?;

    let mut entries = Vec::with_capacity(2);
    for (account, side, amount) in [
        (&debit_account, EntrySide::Debit, &req.debit_amount),
        (&credit_account, EntrySide::Credit, &req.credit_amount),
    ] {
        let entry_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO ledger_entries
                 (id, transaction_id, account_id, side, amount_minor, currency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry_id,
                req.id,
                account.id,
                side.as_str(),
                amount.minor_units(),
                amount.currency().as_str(),
                created_at,
            ],
        )?;
        entries.push(LedgerEntry {
            id: entry_id,
            transaction_id: req.id.to_string(),
            account_id: account.id.clone(),
            side,
            amount: amount.clone(),
            created_at: parse_ts(&created_at),
        });
    }

    Ok(CreatedTransaction {
        transaction: LedgerTransaction {
            id: req.id.to_string(),
            description: req.description.to_string(),
            created_at: parse_ts(&created_at),
        },
        entries,
    })
}

fn replay_or_conflict(
    existing: CreatedTransaction,
    req: &NewLedgerTransaction<'_>,
    debit_account: &Account,
    credit_account: &Account,
) -> Result<CreatedTransaction> {
    let debit = existing
        .entries
        .iter()
        .find(|e| e.side == EntrySide::Debit)
        .ok_or_else(|| PayoutError::Conflict(format!("transaction {} has no debit leg", req.id)))?;
    let credit = existing
        .entries
        .iter()
        .find(|e| e.side == EntrySide::Credit)
        .ok_or_else(|| {
            PayoutError::Conflict(format!("transaction {} has no credit leg", req.id))
        })?;

    let identical = existing.transaction.description == req.description
        && debit.account_id == debit_account.id
        && credit.account_id == credit_account.id
        && debit.amount == req.debit_amount
        && credit.amount == req.credit_amount;

    if identical {
        Ok(existing)
    } else {
        Err(PayoutError::Conflict(format!(
            "transaction {} already exists with a different payload",
            req.id
        )))
    }
}

/// Loads a transaction header with its entries, debit leg first.
pub fn get_transaction(conn: &Connection, id: &str) -> Result<Option<CreatedTransaction>> {
    let header: Option<LedgerTransaction> = conn
        .query_row(
            "SELECT id, description, created_at FROM ledger_transactions WHERE id = ?1",
            params![id],
            |row| {
                Ok(LedgerTransaction {
                    id: row.get(0)?,
                    description: row.get(1)?,
                    created_at: parse_ts(&row.get::<_, String>(2)?),
                })
            },
        )
        .map(Some)
        .or_else(ignore_no_rows)?;

    let Some(transaction) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT id, transaction_id, account_id, side, amount_minor, currency, created_at
         FROM ledger_entries WHERE transaction_id = ?1
         ORDER BY CASE side WHEN 'DEBIT' THEN 0 ELSE 1 END, id",
    )?;
    let entries = stmt
        .query_map(params![id], entry_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(CreatedTransaction {
        transaction,
        entries,
    }))
}

pub fn get_account_by_code(conn: &Connection, code: &str) -> Result<Option<Account>> {
    conn.query_row(
        "SELECT id, code, name, kind, normal_side, created_at FROM accounts WHERE code = ?1",
        params![code],
        account_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn get_account(conn: &Connection, id: &str) -> Result<Option<Account>> {
    conn.query_row(
        "SELECT id, code, name, kind, normal_side, created_at FROM accounts WHERE id = ?1",
        params![id],
        account_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn list_accounts(conn: &Connection) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, code, name, kind, normal_side, created_at FROM accounts ORDER BY code",
    )?;
    let accounts = stmt
        .query_map([], account_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(accounts)
}

/// Raw and signed balance computed from entries in one aggregation.
///
/// The raw figure is debit-minus-credit; the signed figure applies the
/// account's normal side so Asset/Expense balances read positively when
/// debits dominate and Liability/Equity/Revenue balances read positively
/// when credits dominate.
pub fn balance_from_entries(conn: &Connection, account: &Account) -> Result<(i64, i64)> {
    let raw: i64 = conn.query_row(
        "SELECT COALESCE(SUM(CASE WHEN side = 'DEBIT' THEN amount_minor ELSE -amount_minor END), 0)
         FROM ledger_entries WHERE account_id = ?1",
        params![account.id],
        |row| row.get(0),
    )?;
    let signed = match account.normal_side {
        EntrySide::Debit => raw,
        EntrySide::Credit => -raw,
    };
    Ok((signed, raw))
}

/// Keyset cursor over an account's entries, ordered by `(created_at, id)`.
pub fn entries_for_account(
    conn: &Connection,
    account_id: &str,
    after: Option<(&str, &str)>,
    limit: usize,
) -> Result<Vec<LedgerEntry>> {
    let limit = limit as i64;
    let mut entries = Vec::new();
    match after {
        Some((created_at, id)) => {
            let mut stmt = conn.prepare_cached(
                "SELECT id, transaction_id, account_id, side, amount_minor, currency, created_at
                 FROM ledger_entries
                 WHERE account_id = ?1 AND (created_at, id) > (?2, ?3)
                 ORDER BY created_at, id
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(params![account_id, created_at, id, limit], entry_from_row)?;
            for row in rows {
                entries.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT id, transaction_id, account_id, side, amount_minor, currency, created_at
                 FROM ledger_entries
                 WHERE account_id = ?1
                 ORDER BY created_at, id
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![account_id, limit], entry_from_row)?;
            for row in rows {
                entries.push(row?);
            }
        }
    }
    Ok(entries)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let kind_str: String = row.get(3)?;
    let side_str: String = row.get(4)?;
    Ok(Account {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        kind: AccountKind::parse(&kind_str).unwrap_or(AccountKind::Asset),
        normal_side: EntrySide::parse(&side_str).unwrap_or(EntrySide::Debit),
        created_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let side_str: String = row.get(3)?;
    let minor: i64 = row.get(4)?;
    let currency_str: String = row.get(5)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        account_id: row.get(2)?,
        side: EntrySide::parse(&side_str).unwrap_or(EntrySide::Debit),
        amount: Amount::from_minor_units(
            minor,
            Currency::new(&currency_str).unwrap_or_default(),
        ),
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
