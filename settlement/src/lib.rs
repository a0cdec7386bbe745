//! ATC Settlement Engine
//!
//! Moves collected money from grantees to grantors.
//!
//! # Architecture
//!
//! 1. **Batching**: a grant's eligible pending collections are claimed into
//!    one batch, atomically, so a collection is never in two open batches
//! 2. **Payment**: the batch net is handed to a [`PaymentRail`] under a
//!    per-batch idempotency key
//! 3. **Confirmation**: rail callbacks (or timeout lookups) settle or fail
//!    the batch; failures back off exponentially, then escalate to manual
//!    review
//! 4. **Reconciliation**: settled amounts, batch totals and grant cumulative
//!    totals are checked and mismatches recorded as discrepancies
//!
//! Batches are driven by the [`SettlementScheduler`] for periodic grants and
//! by the instant-settlement worker for instant ones.
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, MockPaymentRail, SettlementEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let engine = SettlementEngine::new(Config::default(), Arc::new(MockPaymentRail::new()))?;
//!     let _workers = engine.start()?;
//!
//!     let report = engine.run_scheduler_tick(chrono::Utc::now()).await?;
//!     println!("{} batches created", report.batches_created.len());
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod rail;
pub mod reconciliation;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::Config;
pub use engine::{open_store, GrantRevocation, PendingSettlements, SettlementEngine};
pub use error::{Error, Result};
pub use orchestrator::{ManualResolution, SettlementOrchestrator};
pub use rail::{MockPaymentRail, PaymentInstruction, PaymentRail, RailPaymentRecord, RailReceipt};
pub use reconciliation::{ReconciliationReport, Reconciler};
pub use retry::{RetryDecision, RetryPolicy, RetryStrategy};
pub use scheduler::{closed_period, SettlementScheduler, TickReport};
