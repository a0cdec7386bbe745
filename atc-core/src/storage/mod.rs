//! Storage layer
//!
//! Two backends implement [`AtcStore`]:
//!
//! - [`MemoryStore`] - concurrent maps, for tests and single-process use
//! - [`RocksStore`] - RocksDB column families with bincode values
//!
//! # Atomicity
//!
//! - `reserve` checks a grant's limits, bumps its cumulative total and inserts
//!   the collection as one step under that grant's lock.
//! - `claim_into_batch` moves pending collections into a new batch in one step.
//! - `update_batch` writes a batch and its member collections together.
//!
//! Updates are optimistic: the caller passes the record as it read it, the
//! store rejects the write with [`Error::OptimisticConflict`] if the stored
//! version moved, and bumps the version otherwise.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::limits::LimitRejection;
use crate::types::{
    AtcCollection, AtcGrant, BatchStatus, ReconciliationDiscrepancy, SettlementBatch,
};
use crate::{Error, Result};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Limit check re-run under the grant lock
pub type ReserveGuard<'a> =
    &'a (dyn Fn(&AtcGrant) -> std::result::Result<(), LimitRejection> + Sync);

/// Result of an atomic reserve
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// Capacity reserved
    Accepted {
        /// Cumulative total after the increment
        cumulative: Decimal,
    },
    /// Guard refused; nothing was written
    Rejected {
        /// Why
        rejection: LimitRejection,
        /// Unchanged cumulative total
        cumulative: Decimal,
    },
}

/// Persistent state for the ATC engine
pub trait AtcStore: Send + Sync {
    // Grants

    /// Insert a new grant
    fn insert_grant(&self, grant: &AtcGrant) -> Result<()>;

    /// Get a grant by ID
    fn get_grant(&self, id: Uuid) -> Result<Option<AtcGrant>>;

    /// Optimistic update; returns the stored grant
    fn update_grant(&self, grant: &AtcGrant) -> Result<AtcGrant>;

    /// All grants
    fn list_grants(&self) -> Result<Vec<AtcGrant>>;

    /// Under the grant's lock: run `guard`, add `amount` to the cumulative
    /// total and insert `collection`, or write nothing.
    fn reserve(
        &self,
        grant_id: Uuid,
        amount: Decimal,
        guard: ReserveGuard<'_>,
        collection: Option<&AtcCollection>,
    ) -> Result<ReserveOutcome>;

    // Collections

    /// Get a collection by ID
    fn get_collection(&self, id: Uuid) -> Result<Option<AtcCollection>>;

    /// All collections recorded under a grant, oldest first
    fn collections_for_grant(&self, grant_id: Uuid) -> Result<Vec<AtcCollection>>;

    /// Optimistic update of a collection's settlement fields
    fn update_collection(&self, collection: &AtcCollection) -> Result<AtcCollection>;

    // Batches

    /// Claim the batch's collections that are still pending and unbatched,
    /// recompute its totals from them and insert it. `None` if nothing
    /// could be claimed.
    fn claim_into_batch(&self, batch: &SettlementBatch) -> Result<Option<SettlementBatch>>;

    /// Get a batch by ID
    fn get_batch(&self, id: Uuid) -> Result<Option<SettlementBatch>>;

    /// Optimistic update of a batch together with any member collections
    fn update_batch(
        &self,
        batch: &SettlementBatch,
        members: &[AtcCollection],
    ) -> Result<SettlementBatch>;

    /// All batches
    fn list_batches(&self) -> Result<Vec<SettlementBatch>>;

    // Discrepancies

    /// Record a discrepancy
    fn insert_discrepancy(&self, discrepancy: &ReconciliationDiscrepancy) -> Result<()>;

    /// Overwrite a discrepancy
    fn update_discrepancy(&self, discrepancy: &ReconciliationDiscrepancy) -> Result<()>;

    /// All discrepancies
    fn list_discrepancies(&self) -> Result<Vec<ReconciliationDiscrepancy>>;

    // Derived lookups

    /// Batches of one grant
    fn batches_for_grant(&self, grant_id: Uuid) -> Result<Vec<SettlementBatch>> {
        Ok(self
            .list_batches()?
            .into_iter()
            .filter(|b| b.grant_id == grant_id)
            .collect())
    }

    /// Batches in a given status
    fn batches_in_status(&self, status: BatchStatus) -> Result<Vec<SettlementBatch>> {
        Ok(self
            .list_batches()?
            .into_iter()
            .filter(|b| b.status == status)
            .collect())
    }

    /// Batch carrying a rail reference
    fn find_batch_by_rail_reference(&self, rail_reference: &str) -> Result<Option<SettlementBatch>> {
        Ok(self
            .list_batches()?
            .into_iter()
            .find(|b| b.rail_reference.as_deref() == Some(rail_reference)))
    }

    /// Fetch a grant or fail
    fn require_grant(&self, id: Uuid) -> Result<AtcGrant> {
        self.get_grant(id)?
            .ok_or_else(|| Error::GrantNotFound(id.to_string()))
    }

    /// Fetch a collection or fail
    fn require_collection(&self, id: Uuid) -> Result<AtcCollection> {
        self.get_collection(id)?
            .ok_or_else(|| Error::CollectionNotFound(id.to_string()))
    }

    /// Fetch a batch or fail
    fn require_batch(&self, id: Uuid) -> Result<SettlementBatch> {
        self.get_batch(id)?
            .ok_or_else(|| Error::BatchNotFound(id.to_string()))
    }
}

/// Version check shared by both backends
pub(crate) fn check_version(kind: &str, id: Uuid, stored: u64, given: u64) -> Result<()> {
    if stored != given {
        return Err(Error::OptimisticConflict(format!(
            "{} {} is at version {}, write was based on {}",
            kind, id, stored, given
        )));
    }
    Ok(())
}

/// Members of `batch` that can be claimed right now
pub(crate) fn claimable(collection: &AtcCollection, batch: &SettlementBatch) -> bool {
    collection.grant_id == batch.grant_id
        && collection.settlement_status == crate::types::SettlementStatus::Pending
        && collection.settlement_batch_id.is_none()
}
