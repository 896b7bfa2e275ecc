//! Read-model projector.
//!
//! Projection rows are written inside the same atomic unit as the source
//! rows they summarize, so a committed read model can never contradict the
//! ledger or the payout table. A projector failure aborts the whole unit.
//!
//! `rebuild` recomputes every row from ledger entries and payout rows alone
//! and must produce the same balances as incremental application.

use crate::amount::{Amount, Currency};
use crate::error::{PayoutError, Result};
use crate::ledger;
use crate::models::{
    AccountBalanceRow, EntrySide, LedgerEntry, Payout, PayoutStatus, PayoutSummaryRow,
    TransactionSummaryRow,
};
use crate::store::{ignore_no_rows, now_rfc3339};
use rusqlite::{params, Connection, Row};

/// Applies a committed pair of ledger entries to the balance rows of the
/// affected accounts and records the transaction summary.
pub fn apply_ledger_entries(
    conn: &Connection,
    entries: &[LedgerEntry],
    as_of_sequence: i64,
) -> Result<()> {
    for entry in entries {
        let account = ledger::get_account(conn, &entry.account_id)?
            .ok_or_else(|| PayoutError::UnknownAccount(entry.account_id.clone()))?;

        let raw_delta = match entry.side {
            EntrySide::Debit => entry.amount.minor_units(),
            EntrySide::Credit => -entry.amount.minor_units(),
        };
        let signed_delta = match account.normal_side {
            EntrySide::Debit => raw_delta,
            EntrySide::Credit => -raw_delta,
        };

        conn.execute(
            "INSERT INTO account_balances
                 (account_id, balance_minor, debit_minus_credit_minor, currency, as_of_sequence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account_id) DO UPDATE SET
                balance_minor = balance_minor + excluded.balance_minor,
                debit_minus_credit_minor = debit_minus_credit_minor + excluded.debit_minus_credit_minor,
                as_of_sequence = excluded.as_of_sequence,
                updated_at = excluded.updated_at",
            params![
                account.id,
                signed_delta,
                raw_delta,
                entry.amount.currency().as_str(),
                as_of_sequence,
                now_rfc3339(),
            ],
        )?;
    }

    if let (Some(debit), Some(credit)) = (
        entries.iter().find(|e| e.side == EntrySide::Debit),
        entries.iter().find(|e| e.side == EntrySide::Credit),
    ) {
        let debit_account = ledger::get_account(conn, &debit.account_id)?
            .ok_or_else(|| PayoutError::UnknownAccount(debit.account_id.clone()))?;
        let credit_account = ledger::get_account(conn, &credit.account_id)?
            .ok_or_else(|| PayoutError::UnknownAccount(credit.account_id.clone()))?;

        conn.execute(
            "INSERT OR REPLACE INTO ledger_transaction_summaries
                 (transaction_id, debit_account, credit_account, amount_minor, currency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                debit.transaction_id,
                debit_account.code,
                credit_account.code,
                debit.amount.minor_units(),
                debit.amount.currency().as_str(),
                debit
                    .created_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ],
        )?;
    }

    Ok(())
}

/// Upserts the payout summary row from the current payout record.
pub fn apply_payout_change(conn: &Connection, payout: &Payout) -> Result<()> {
    conn.execute(
        "INSERT INTO payout_summaries
             (payout_id, idempotency_key, amount_minor, currency, recipient_account,
              status, created_at, processed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(payout_id) DO UPDATE SET
            status = excluded.status,
            processed_at = excluded.processed_at,
            updated_at = excluded.updated_at",
        params![
            payout.id,
            payout.idempotency_key,
            payout.amount.minor_units(),
            payout.amount.currency().as_str(),
            payout.recipient_account,
            payout.status.as_str(),
            payout
                .created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            payout
                .processed_at
                .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Drops and recomputes all projection rows from source data only.
///
/// Balances come straight from the entry aggregation, summaries from the
/// payout and transaction tables. `as_of_sequence` is set to the highest
/// committed sequence number, the high-water mark the projections now cover.
pub fn rebuild(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM account_balances", [])?;
    conn.execute("DELETE FROM payout_summaries", [])?;
    conn.execute("DELETE FROM ledger_transaction_summaries", [])?;

    let max_sequence = crate::events::max_sequence(conn)?;

    for account in ledger::list_accounts(conn)? {
        let (signed, raw) = ledger::balance_from_entries(conn, &account)?;
        let currency: Option<String> = conn
            .query_row(
                "SELECT currency FROM ledger_entries WHERE account_id = ?1 LIMIT 1",
                params![account.id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)?;

        conn.execute(
            "INSERT INTO account_balances
                 (account_id, balance_minor, debit_minus_credit_minor, currency, as_of_sequence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.id,
                signed,
                raw,
                currency.unwrap_or_else(|| Currency::usd().as_str().to_string()),
                max_sequence,
                now_rfc3339(),
            ],
        )?;
    }

    conn.execute(
        "INSERT INTO ledger_transaction_summaries
             (transaction_id, debit_account, credit_account, amount_minor, currency, created_at)
         SELECT t.id,
                da.code,
                ca.code,
                de.amount_minor,
                de.currency,
                t.created_at
         FROM ledger_transactions t
         JOIN ledger_entries de ON de.transaction_id = t.id AND de.side = 'DEBIT'
         JOIN ledger_entries ce ON ce.transaction_id = t.id AND ce.side = 'CREDIT'
         JOIN accounts da ON da.id = de.account_id
         JOIN accounts ca ON ca.id = ce.account_id",
        [],
    )?;

    conn.execute(
        "INSERT INTO payout_summaries
             (payout_id, idempotency_key, amount_minor, currency, recipient_account,
              status, created_at, processed_at, updated_at)
         SELECT id, idempotency_key, amount_minor, currency, recipient_account,
                status, created_at, processed_at, ?1
         FROM payouts",
        params![now_rfc3339()],
    )?;

    Ok(())
}

/// Projected balance row for an account code, if any entries have landed.
pub fn account_balance(conn: &Connection, code: &str) -> Result<Option<AccountBalanceRow>> {
    conn.query_row(
        "SELECT b.account_id, b.balance_minor, b.debit_minus_credit_minor, b.currency, b.as_of_sequence
         FROM account_balances b JOIN accounts a ON a.id = b.account_id
         WHERE a.code = ?1",
        params![code],
        balance_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn all_account_balances(conn: &Connection) -> Result<Vec<AccountBalanceRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT account_id, balance_minor, debit_minus_credit_minor, currency, as_of_sequence
         FROM account_balances ORDER BY account_id",
    )?;
    let rows = stmt
        .query_map([], balance_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn payout_summary(conn: &Connection, payout_id: &str) -> Result<Option<PayoutSummaryRow>> {
    conn.query_row(
        "SELECT payout_id, idempotency_key, amount_minor, currency, recipient_account,
                status, created_at, processed_at
         FROM payout_summaries WHERE payout_id = ?1",
        params![payout_id],
        payout_summary_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn all_payout_summaries(conn: &Connection) -> Result<Vec<PayoutSummaryRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT payout_id, idempotency_key, amount_minor, currency, recipient_account,
                status, created_at, processed_at
         FROM payout_summaries ORDER BY payout_id",
    )?;
    let rows = stmt
        .query_map([], payout_summary_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn transaction_summary(
    conn: &Connection,
    transaction_id: &str,
) -> Result<Option<TransactionSummaryRow>> {
    conn.query_row(
        "SELECT transaction_id, debit_account, credit_account, amount_minor, currency, created_at
         FROM ledger_transaction_summaries WHERE transaction_id = ?1",
        params![transaction_id],
        transaction_summary_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

pub fn all_transaction_summaries(conn: &Connection) -> Result<Vec<TransactionSummaryRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT transaction_id, debit_account, credit_account, amount_minor, currency, created_at
         FROM ledger_transaction_summaries ORDER BY transaction_id",
    )?;
    let rows = stmt
        .query_map([], transaction_summary_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn balance_from_row(row: &Row<'_>) -> rusqlite::Result<AccountBalanceRow> {
    let currency_str: String = row.get(3)?;
    let currency = Currency::new(&currency_str).unwrap_or_default();
    Ok(AccountBalanceRow {
        account_id: row.get(0)?,
        balance: Amount::from_minor_units(row.get(1)?, currency.clone()),
        debit_minus_credit: Amount::from_minor_units(row.get(2)?, currency),
        as_of_sequence: row.get(4)?,
    })
}

fn payout_summary_from_row(row: &Row<'_>) -> rusqlite::Result<PayoutSummaryRow> {
    let currency_str: String = row.get(3)?;
    let status_str: String = row.get(5)?;
    Ok(PayoutSummaryRow {
        payout_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        amount: Amount::from_minor_units(
            row.get(2)?,
            Currency::new(&currency_str).unwrap_or_default(),
        ),
        recipient_account: row.get(4)?,
        status: PayoutStatus::parse(&status_str).unwrap_or(PayoutStatus::Pending),
        created_at: ledger::parse_ts(&row.get::<_, String>(6)?),
        processed_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| ledger::parse_ts(&raw)),
    })
}

fn transaction_summary_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionSummaryRow> {
    let currency_str: String = row.get(4)?;
    Ok(TransactionSummaryRow {
        transaction_id: row.get(0)?,
        debit_account: row.get(1)?,
        credit_account: row.get(2)?,
        amount: Amount::from_minor_units(
            row.get(3)?,
            Currency::new(&currency_str).unwrap_or_default(),
        ),
        created_at: ledger::parse_ts(&row.get::<_, String>(5)?),
    })
}
