//! Payout processing: state machine, external provider seam, and the
//! worker dispatcher that drives payouts through to a terminal state.

pub mod provider;
pub mod state_machine;
pub mod worker;

pub use provider::{
    HttpPayoutProvider, PayoutProvider, ProviderError, ProviderReceipt, ProviderRequest,
    SimulatedProvider,
};
pub use state_machine::{FailureOutcome, IntakeOutcome, PayoutEngine, PayoutRequest};
pub use worker::{Dispatcher, RetryPolicy, StepOutcome, WorkItem, WorkerConfig};
