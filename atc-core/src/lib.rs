//! ATC Core
//!
//! Authority-to-Collect grants, limit enforcement, commission calculation and
//! the collection ledger.
//!
//! # Architecture
//!
//! - **Grant tree**: authority flows from root authorities down parent grants
//! - **Atomic reserve**: limit check, cumulative increment and collection
//!   insert happen in one per-grant storage step
//! - **Exact money**: `Decimal` everywhere, one banker's rounding per split
//! - **Pluggable storage**: in-memory maps or RocksDB behind [`AtcStore`]
//!
//! # Invariants
//!
//! - cumulative_collected == Σ gross of the grant's collections
//! - gross == commission + net for every collection
//! - A grant's status only moves along its transition table

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    clippy::all
)]

pub mod commission;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod limits;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use commission::{CommissionCalculator, CommissionSplit};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{AtcEvent, EventBus};
pub use ledger::CollectionLedger;
pub use limits::{LimitEnforcer, LimitRejection, Reservation};
pub use metrics::Metrics;
pub use registry::{CreateGrantRequest, GrantNode, GrantRegistry};
pub use storage::{AtcStore, MemoryStore, RocksStore};
pub use types::{
    AtcCollection, AtcGrant, BatchStatus, CollectionMethod, Currency, GrantScope, GrantStatus,
    PartyId, PartyType, SettlementBatch, SettlementStatus,
};
