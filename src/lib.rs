//! Payout Engine Library
//!
//! Double-entry ledger with an exactly-once payout state machine, an ordered
//! event log and in-transaction read-model projections. Exposes all modules
//! for use by the server binary, the admin binaries and the test suites.

pub mod amount;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod payouts;
pub mod projection;
pub mod store;
