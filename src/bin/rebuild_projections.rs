//! Offline rebuild of all read-model rows from source truth.
//!
//! Drops the projected balances and summaries and recomputes them from
//! ledger entries and payout rows in one transaction. Safe to run while the
//! service is stopped, or against a copy of the database.
//!
//! Usage:
//!   cargo run --bin rebuild_projections -- --db-path ./payout_engine.db

use anyhow::Result;
use clap::Parser;
use payout_engine::error::PayoutError;
use payout_engine::projection;
use payout_engine::store::Store;

#[derive(Parser, Debug)]
#[command(name = "rebuild_projections")]
#[command(about = "Recompute read models from ledger entries and payouts")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, default_value = "payout_engine.db")]
    db_path: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = Store::open(&cli.db_path)?;
    store.with_txn(|txn| projection::rebuild(txn))?;

    let (balances, payouts, transactions) = store.read(|conn| {
        let balances: i64 = conn
            .query_row("SELECT COUNT(*) FROM account_balances", [], |r| r.get(0))
            .map_err(PayoutError::Storage)?;
        let payouts: i64 = conn
            .query_row("SELECT COUNT(*) FROM payout_summaries", [], |r| r.get(0))
            .map_err(PayoutError::Storage)?;
        let transactions: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM ledger_transaction_summaries",
                [],
                |r| r.get(0),
            )
            .map_err(PayoutError::Storage)?;
        Ok((balances, payouts, transactions))
    })?;

    println!(
        "Rebuilt read models: {balances} account balances, {payouts} payout summaries, {transactions} transaction summaries."
    );

    Ok(())
}
