//! RocksDB store
//!
//! # Column Families
//!
//! - `grants` - Grants (key: grant_id)
//! - `collections` - Collections (key: collection_id)
//! - `batches` - Settlement batches (key: batch_id)
//! - `discrepancies` - Reconciliation discrepancies (key: discrepancy_id)
//! - `indices` - Secondary index: grant_id || collection_id -> empty

use super::{check_version, claimable, AtcStore, ReserveGuard, ReserveOutcome};
use crate::config::RocksDbConfig;
use crate::types::{
    AtcCollection, AtcGrant, ReconciliationDiscrepancy, SettlementBatch, SettlementStatus,
};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, IteratorMode, Options,
    WriteBatch, DB,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const CF_GRANTS: &str = "grants";
const CF_COLLECTIONS: &str = "collections";
const CF_BATCHES: &str = "batches";
const CF_DISCREPANCIES: &str = "discrepancies";
const CF_INDICES: &str = "indices";

/// Durable store on RocksDB.
///
/// Read-modify-write of a grant happens under that grant's lock; settlement
/// writes (claims, batch updates) share one lock and commit as a `WriteBatch`.
pub struct RocksStore {
    db: Arc<DB>,
    grant_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    settlement_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>, config: &RocksDbConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);
        if config.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_GRANTS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_COLLECTIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_BATCHES, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_DISCREPANCIES, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened RocksDB store");

        Ok(Self {
            db: Arc::new(db),
            grant_locks: DashMap::new(),
            settlement_lock: Mutex::new(()),
        })
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf_name: &str, id: Uuid) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    fn grant_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.grant_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn index_key(grant_id: Uuid, collection_id: Uuid) -> Vec<u8> {
        let mut key = grant_id.as_bytes().to_vec();
        key.extend_from_slice(collection_id.as_bytes());
        key
    }

    fn stored_collection(&self, collection: &AtcCollection) -> Result<AtcCollection> {
        let stored: AtcCollection = self
            .get_value(CF_COLLECTIONS, collection.id)?
            .ok_or_else(|| Error::CollectionNotFound(collection.id.to_string()))?;
        check_version("collection", collection.id, stored.version, collection.version)?;
        Ok(stored)
    }

    fn put_record<T: serde::Serialize>(
        batch: &mut WriteBatch,
        cf: &Arc<BoundColumnFamily<'_>>,
        id: Uuid,
        record: &T,
    ) -> Result<()> {
        batch.put_cf(cf, id.as_bytes(), bincode::serialize(record)?);
        Ok(())
    }

    /// Close database
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB store closed");
        Ok(())
    }
}

impl AtcStore for RocksStore {
    fn insert_grant(&self, grant: &AtcGrant) -> Result<()> {
        let lock = self.grant_lock(grant.id);
        let _guard = lock.lock();
        if self.get_value::<AtcGrant>(CF_GRANTS, grant.id)?.is_some() {
            return Err(Error::Validation(format!("grant {} already exists", grant.id)));
        }
        let cf = self.cf(CF_GRANTS)?;
        self.db
            .put_cf(&cf, grant.id.as_bytes(), bincode::serialize(grant)?)?;
        Ok(())
    }

    fn get_grant(&self, id: Uuid) -> Result<Option<AtcGrant>> {
        self.get_value(CF_GRANTS, id)
    }

    fn update_grant(&self, grant: &AtcGrant) -> Result<AtcGrant> {
        let lock = self.grant_lock(grant.id);
        let _guard = lock.lock();

        let stored = self.require_grant(grant.id)?;
        check_version("grant", grant.id, stored.version, grant.version)?;

        let mut next = grant.clone();
        next.cumulative_collected = stored.cumulative_collected;
        next.version += 1;
        let cf = self.cf(CF_GRANTS)?;
        self.db
            .put_cf(&cf, next.id.as_bytes(), bincode::serialize(&next)?)?;
        Ok(next)
    }

    fn list_grants(&self) -> Result<Vec<AtcGrant>> {
        let mut grants: Vec<AtcGrant> = self.scan(CF_GRANTS)?;
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
        let lock = self.grant_lock(grant_id);
        let _guard = lock.lock();

        let mut grant = self.require_grant(grant_id)?;
        if let Err(rejection) = guard(&grant) {
            return Ok(ReserveOutcome::Rejected {
                rejection,
                cumulative: grant.cumulative_collected,
            });
        }
        grant.cumulative_collected += amount;

        let mut batch = WriteBatch::default();
        let cf_grants = self.cf(CF_GRANTS)?;
        batch.put_cf(&cf_grants, grant.id.as_bytes(), bincode::serialize(&grant)?);

        if let Some(c) = collection {
            let cf_collections = self.cf(CF_COLLECTIONS)?;
            let cf_indices = self.cf(CF_INDICES)?;
            batch.put_cf(&cf_collections, c.id.as_bytes(), bincode::serialize(c)?);
            batch.put_cf(&cf_indices, Self::index_key(grant_id, c.id), b"");
        }

        self.db.write(batch)?;
        Ok(ReserveOutcome::Accepted {
            cumulative: grant.cumulative_collected,
        })
    }

    fn get_collection(&self, id: Uuid) -> Result<Option<AtcCollection>> {
        self.get_value(CF_COLLECTIONS, id)
    }

    fn collections_for_grant(&self, grant_id: Uuid) -> Result<Vec<AtcCollection>> {
        let cf_indices = self.cf(CF_INDICES)?;
        let prefix = grant_id.as_bytes();

        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf_indices, prefix) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if key.len() < 32 {
                continue;
            }
            let id = Uuid::from_slice(&key[16..32])
                .map_err(|e| Error::Storage(format!("Corrupt index key: {}", e)))?;
            if let Some(c) = self.get_collection(id)? {
                out.push(c);
            }
        }
        out.sort_by_key(|c: &AtcCollection| c.collected_at);
        Ok(out)
    }

    fn update_collection(&self, collection: &AtcCollection) -> Result<AtcCollection> {
        let _guard = self.settlement_lock.lock();
        self.stored_collection(collection)?;

        let mut next = collection.clone();
        next.version += 1;
        let cf = self.cf(CF_COLLECTIONS)?;
        self.db
            .put_cf(&cf, next.id.as_bytes(), bincode::serialize(&next)?)?;
        Ok(next)
    }

    fn claim_into_batch(&self, batch: &SettlementBatch) -> Result<Option<SettlementBatch>> {
        let _guard = self.settlement_lock.lock();

        let mut claimed = Vec::new();
        for id in &batch.collection_ids {
            if let Some(mut c) = self.get_collection(*id)? {
                if claimable(&c, batch) {
                    c.settlement_status = SettlementStatus::Scheduled;
                    c.settlement_batch_id = Some(batch.id);
                    c.version += 1;
                    claimed.push(c);
                }
            }
        }
        if claimed.is_empty() {
            return Ok(None);
        }

        let mut stored = batch.clone();
        stored.apply_members(&claimed);

        let mut wb = WriteBatch::default();
        let cf_collections = self.cf(CF_COLLECTIONS)?;
        let cf_batches = self.cf(CF_BATCHES)?;
        for c in &claimed {
            Self::put_record(&mut wb, &cf_collections, c.id, c)?;
        }
        Self::put_record(&mut wb, &cf_batches, stored.id, &stored)?;
        self.db.write(wb)?;

        Ok(Some(stored))
    }

    fn get_batch(&self, id: Uuid) -> Result<Option<SettlementBatch>> {
        self.get_value(CF_BATCHES, id)
    }

    fn update_batch(
        &self,
        batch: &SettlementBatch,
        members: &[AtcCollection],
    ) -> Result<SettlementBatch> {
        let _guard = self.settlement_lock.lock();

        let stored = self.require_batch(batch.id)?;
        check_version("batch", batch.id, stored.version, batch.version)?;
        for c in members {
            self.stored_collection(c)?;
        }

        let mut wb = WriteBatch::default();
        let cf_collections = self.cf(CF_COLLECTIONS)?;
        let cf_batches = self.cf(CF_BATCHES)?;
        for c in members {
            let mut next = c.clone();
            next.version += 1;
            Self::put_record(&mut wb, &cf_collections, next.id, &next)?;
        }
        let mut next = batch.clone();
        next.version += 1;
        Self::put_record(&mut wb, &cf_batches, next.id, &next)?;
        self.db.write(wb)?;

        Ok(next)
    }

    fn list_batches(&self) -> Result<Vec<SettlementBatch>> {
        let mut batches: Vec<SettlementBatch> = self.scan(CF_BATCHES)?;
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    fn insert_discrepancy(&self, discrepancy: &ReconciliationDiscrepancy) -> Result<()> {
        let cf = self.cf(CF_DISCREPANCIES)?;
        self.db.put_cf(
            &cf,
            discrepancy.id.as_bytes(),
            bincode::serialize(discrepancy)?,
        )?;
        Ok(())
    }

    fn update_discrepancy(&self, discrepancy: &ReconciliationDiscrepancy) -> Result<()> {
        if self
            .get_value::<ReconciliationDiscrepancy>(CF_DISCREPANCIES, discrepancy.id)?
            .is_none()
        {
            return Err(Error::Validation(format!(
                "discrepancy {} not found",
                discrepancy.id
            )));
        }
        self.insert_discrepancy(discrepancy)
    }

    fn list_discrepancies(&self) -> Result<Vec<ReconciliationDiscrepancy>> {
        let mut out: Vec<ReconciliationDiscrepancy> = self.scan(CF_DISCREPANCIES)?;
        out.sort_by_key(|d| d.detected_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{active_grant, batch_for, collection_for};
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(temp_dir.path(), &RocksDbConfig::default()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (store, _temp) = open_store();
        for cf in [CF_GRANTS, CF_COLLECTIONS, CF_BATCHES, CF_DISCREPANCIES, CF_INDICES] {
            assert!(store.db.cf_handle(cf).is_some());
        }
    }

    #[test]
    fn test_grant_roundtrip_and_version() {
        let (store, _temp) = open_store();
        let grant = active_grant(Utc::now());
        store.insert_grant(&grant).unwrap();
        assert!(store.insert_grant(&grant).is_err());

        let fetched = store.require_grant(grant.id).unwrap();
        assert_eq!(fetched, grant);

        store.update_grant(&fetched).unwrap();
        assert!(matches!(
            store.update_grant(&fetched),
            Err(Error::OptimisticConflict(_))
        ));
    }

    #[test]
    fn test_reserve_writes_collection_and_index() {
        let (store, _temp) = open_store();
        let now = Utc::now();
        let grant = active_grant(now);
        store.insert_grant(&grant).unwrap();

        for amount in [100, 250] {
            let c = collection_for(&grant, Decimal::from(amount), now);
            let outcome = store
                .reserve(grant.id, c.gross_amount, &|_| Ok(()), Some(&c))
                .unwrap();
            assert!(matches!(outcome, ReserveOutcome::Accepted { .. }));
        }

        let collections = store.collections_for_grant(grant.id).unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(
            store.require_grant(grant.id).unwrap().cumulative_collected,
            Decimal::from(350)
        );

        // Another grant's index entries stay separate
        let other = active_grant(now);
        store.insert_grant(&other).unwrap();
        assert!(store.collections_for_grant(other.id).unwrap().is_empty());
    }

    #[test]
    fn test_claim_and_update_batch() {
        let (store, _temp) = open_store();
        let now = Utc::now();
        let grant = active_grant(now);
        store.insert_grant(&grant).unwrap();
        let c = collection_for(&grant, Decimal::from(100), now);
        store
            .reserve(grant.id, c.gross_amount, &|_| Ok(()), Some(&c))
            .unwrap();

        let batch = store
            .claim_into_batch(&batch_for(&grant, &[c.id], now))
            .unwrap()
            .unwrap();
        assert_eq!(batch.total_gross, Decimal::from(100));

        let mut member = store.require_collection(c.id).unwrap();
        assert_eq!(member.settlement_status, SettlementStatus::Scheduled);
        member.settlement_status = SettlementStatus::Processing;
        let updated = store.update_batch(&batch, &[member]).unwrap();
        assert_eq!(updated.version, batch.version + 1);
        assert_eq!(
            store.require_collection(c.id).unwrap().settlement_status,
            SettlementStatus::Processing
        );
    }

    #[test]
    fn test_reopen_preserves_state() {
        let temp_dir = TempDir::new().unwrap();
        let grant = active_grant(Utc::now());
        {
            let store = RocksStore::open(temp_dir.path(), &RocksDbConfig::default()).unwrap();
            store.insert_grant(&grant).unwrap();
            store.close().unwrap();
        }
        let store = RocksStore::open(temp_dir.path(), &RocksDbConfig::default()).unwrap();
        assert_eq!(store.require_grant(grant.id).unwrap().id, grant.id);
    }
}
