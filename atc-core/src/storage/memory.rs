//! In-memory store

use super::{check_version, claimable, AtcStore, ReserveGuard, ReserveOutcome};
use crate::types::{
    AtcCollection, AtcGrant, ReconciliationDiscrepancy, SettlementBatch, SettlementStatus,
};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Concurrent in-memory store.
///
/// A grant's map entry lock is the per-grant lock for `reserve`. Batch and
/// collection settlement writes share one mutex so multi-record updates
/// are all-or-nothing.
#[derive(Default)]
pub struct MemoryStore {
    grants: DashMap<Uuid, AtcGrant>,
    collections: DashMap<Uuid, AtcCollection>,
    collections_by_grant: DashMap<Uuid, Vec<Uuid>>,
    batches: DashMap<Uuid, SettlementBatch>,
    discrepancies: DashMap<Uuid, ReconciliationDiscrepancy>,
    settlement_lock: Mutex<()>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn check_collection(&self, collection: &AtcCollection) -> Result<()> {
        let stored = self
            .collections
            .get(&collection.id)
            .ok_or_else(|| Error::CollectionNotFound(collection.id.to_string()))?;
        check_version("collection", collection.id, stored.version, collection.version)
    }

    fn put_collection(&self, collection: &AtcCollection) -> AtcCollection {
        let mut next = collection.clone();
        next.version += 1;
        self.collections.insert(next.id, next.clone());
        next
    }
}

impl AtcStore for MemoryStore {
    fn insert_grant(&self, grant: &AtcGrant) -> Result<()> {
        if self.grants.contains_key(&grant.id) {
            return Err(Error::Validation(format!("grant {} already exists", grant.id)));
        }
        self.grants.insert(grant.id, grant.clone());
        Ok(())
    }

    fn get_grant(&self, id: Uuid) -> Result<Option<AtcGrant>> {
        Ok(self.grants.get(&id).map(|g| g.clone()))
    }

    fn update_grant(&self, grant: &AtcGrant) -> Result<AtcGrant> {
        let mut entry = self
            .grants
            .get_mut(&grant.id)
            .ok_or_else(|| Error::GrantNotFound(grant.id.to_string()))?;
        check_version("grant", grant.id, entry.version, grant.version)?;

        let mut next = grant.clone();
        // The running total belongs to reserve
        next.cumulative_collected = entry.cumulative_collected;
        next.version += 1;
        *entry = next.clone();
        Ok(next)
    }

    fn list_grants(&self) -> Result<Vec<AtcGrant>> {
        let mut grants: Vec<_> = self.grants.iter().map(|g| g.clone()).collect();
        grants.sort_by_key(|g| g.created_at);
        Ok(grants)
    }

    fn reserve(
        &self,
        grant_id: Uuid,
        amount: Decimal,
        guard: ReserveGuard<'_>,
        collection: Option<&AtcCollection>,
    ) -> Result<ReserveOutcome> {
        let mut grant = self
            .grants
            .get_mut(&grant_id)
            .ok_or_else(|| Error::GrantNotFound(grant_id.to_string()))?;

        if let Err(rejection) = guard(&*grant) {
            return Ok(ReserveOutcome::Rejected {
                rejection,
                cumulative: grant.cumulative_collected,
            });
        }

        // Cumulative total is outside the grant version
        grant.cumulative_collected += amount;

        if let Some(c) = collection {
            self.collections.insert(c.id, c.clone());
            self.collections_by_grant
                .entry(grant_id)
                .or_default()
                .push(c.id);
        }

        Ok(ReserveOutcome::Accepted {
            cumulative: grant.cumulative_collected,
        })
    }

    fn get_collection(&self, id: Uuid) -> Result<Option<AtcCollection>> {
        Ok(self.collections.get(&id).map(|c| c.clone()))
    }

    fn collections_for_grant(&self, grant_id: Uuid) -> Result<Vec<AtcCollection>> {
        let ids = self
            .collections_by_grant
            .get(&grant_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut out: Vec<_> = ids
            .iter()
            .filter_map(|id| self.collections.get(id).map(|c| c.clone()))
            .collect();
        out.sort_by_key(|c| c.collected_at);
        Ok(out)
    }

    fn update_collection(&self, collection: &AtcCollection) -> Result<AtcCollection> {
        let _guard = self.settlement_lock.lock();
        self.check_collection(collection)?;
        Ok(self.put_collection(collection))
    }

    fn claim_into_batch(&self, batch: &SettlementBatch) -> Result<Option<SettlementBatch>> {
        let _guard = self.settlement_lock.lock();

        let members: Vec<AtcCollection> = batch
            .collection_ids
            .iter()
            .filter_map(|id| self.collections.get(id).map(|c| c.clone()))
            .filter(|c| claimable(c, batch))
            .collect();
        if members.is_empty() {
            return Ok(None);
        }

        let mut claimed = Vec::with_capacity(members.len());
        for mut c in members {
            c.settlement_status = SettlementStatus::Scheduled;
            c.settlement_batch_id = Some(batch.id);
            claimed.push(self.put_collection(&c));
        }

        let mut stored = batch.clone();
        stored.apply_members(&claimed);
        self.batches.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    fn get_batch(&self, id: Uuid) -> Result<Option<SettlementBatch>> {
        Ok(self.batches.get(&id).map(|b| b.clone()))
    }

    fn update_batch(
        &self,
        batch: &SettlementBatch,
        members: &[AtcCollection],
    ) -> Result<SettlementBatch> {
        let _guard = self.settlement_lock.lock();

        {
            let stored = self
                .batches
                .get(&batch.id)
                .ok_or_else(|| Error::BatchNotFound(batch.id.to_string()))?;
            check_version("batch", batch.id, stored.version, batch.version)?;
        }
        for c in members {
            self.check_collection(c)?;
        }

        for c in members {
            self.put_collection(c);
        }
        let mut next = batch.clone();
        next.version += 1;
        self.batches.insert(next.id, next.clone());
        Ok(next)
    }

    fn list_batches(&self) -> Result<Vec<SettlementBatch>> {
        let mut batches: Vec<_> = self.batches.iter().map(|b| b.clone()).collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    fn insert_discrepancy(&self, discrepancy: &ReconciliationDiscrepancy) -> Result<()> {
        self.discrepancies.insert(discrepancy.id, discrepancy.clone());
        Ok(())
    }

    fn update_discrepancy(&self, discrepancy: &ReconciliationDiscrepancy) -> Result<()> {
        if !self.discrepancies.contains_key(&discrepancy.id) {
            return Err(Error::Validation(format!(
                "discrepancy {} not found",
                discrepancy.id
            )));
        }
        self.discrepancies.insert(discrepancy.id, discrepancy.clone());
        Ok(())
    }

    fn list_discrepancies(&self) -> Result<Vec<ReconciliationDiscrepancy>> {
        let mut out: Vec<_> = self.discrepancies.iter().map(|d| d.clone()).collect();
        out.sort_by_key(|d| d.detected_at);
        Ok(out)
    }
}
