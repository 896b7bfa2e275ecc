//! One-shot bootstrap of the required ledger accounts.
//!
//! Usage:
//!   cargo run --bin init_accounts -- --db-path ./payout_engine.db

use anyhow::Result;
use clap::Parser;
use payout_engine::store::Store;

#[derive(Parser, Debug)]
#[command(name = "init_accounts")]
#[command(about = "Create the cash and payout-liability accounts if absent")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, default_value = "payout_engine.db")]
    db_path: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = Store::open(&cli.db_path)?;
    let created = store.bootstrap_accounts()?;

    if created.is_empty() {
        println!("All required accounts already exist.");
    } else {
        for account in created {
            println!(
                "Created account: {} ({} / {}-normal)",
                account.code,
                account.kind.as_str(),
                account.normal_side.as_str()
            );
        }
    }

    Ok(())
}
