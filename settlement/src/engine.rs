//! ATC settlement engine
//!
//! Public facade over the grant registry, collection ledger, settlement
//! orchestrator, reconciler and scheduler. All components share one store,
//! one event bus and one metrics registry.

use crate::{
    config::Config,
    orchestrator::{ManualResolution, SettlementOrchestrator},
    rail::PaymentRail,
    reconciliation::{ReconciliationReport, Reconciler},
    retry::RetryStrategy,
    scheduler::{SettlementScheduler, TickReport},
    Error, Result,
};
use atc_core::config::StorageBackend;
use atc_core::ledger::{
    AuthorityCheck, CollectionSummary, CommissionSummary, GrantSelector, InstantSettlement,
    RecordCollectionRequest,
};
use atc_core::types::{
    AtcCollection, AtcGrant, CollectionMethod, OrderContext, PartyId, PaymentStatus,
    ReconciliationDiscrepancy, SettlementBatch, SettlementStatus,
};
use atc_core::{
    AtcEvent, AtcStore, CollectionLedger, CreateGrantRequest, EventBus, GrantNode, GrantRegistry,
    MemoryStore, Metrics, RocksStore,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of revoking a grant
#[derive(Debug, Clone, Serialize)]
pub struct GrantRevocation {
    /// The revoked grant
    pub grant: AtcGrant,
    /// Unsettled collections flagged for reconciliation
    pub flagged_collections: Vec<Uuid>,
    /// Open batches cancelled, their collections back to pending
    pub cancelled_batches: Vec<Uuid>,
}

/// Unsettled money for one party, as grantor or grantee
#[derive(Debug, Clone, Default, Serialize)]
pub struct PendingSettlements {
    /// Collections pending, scheduled or in flight
    pub collections: Vec<AtcCollection>,
    /// Batches not yet settled or cancelled
    pub batches: Vec<SettlementBatch>,
}

impl PendingSettlements {
    /// Net owed to grantors across the unsettled collections
    pub fn total_net(&self) -> Decimal {
        self.collections.iter().map(|c| c.net_amount).sum()
    }
}

/// Open the store selected by `config`
pub fn open_store(config: &atc_core::Config) -> Result<Arc<dyn AtcStore>> {
    let store: Arc<dyn AtcStore> = match config.storage {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Rocksdb => Arc::new(RocksStore::open(&config.data_dir, &config.rocksdb)?),
    };
    info!(backend = ?config.storage, data_dir = ?config.data_dir, "Store opened");
    Ok(store)
}

/// ATC settlement engine
pub struct SettlementEngine {
    config: Config,
    store: Arc<dyn AtcStore>,
    events: EventBus,
    metrics: Metrics,
    registry: Arc<GrantRegistry>,
    ledger: CollectionLedger,
    orchestrator: Arc<SettlementOrchestrator>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<SettlementScheduler>,
    instant_rx: Mutex<Option<mpsc::Receiver<InstantSettlement>>>,
    shutdown: watch::Sender<bool>,
}

impl SettlementEngine {
    /// Create an engine over the store named in `config`
    pub fn new(config: Config, rail: Arc<dyn PaymentRail>) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.core)?;
        Self::with_store(config, store, rail)
    }

    /// Create an engine over an existing store
    pub fn with_store(
        config: Config,
        store: Arc<dyn AtcStore>,
        rail: Arc<dyn PaymentRail>,
    ) -> Result<Self> {
        let events = EventBus::new(config.event_capacity);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;
        let currency = config.core.currency;

        let registry = Arc::new(GrantRegistry::new(
            store.clone(),
            config.core.policy.clone(),
            currency,
            events.clone(),
            metrics.clone(),
        ));

        let (instant_tx, instant_rx) = mpsc::channel(config.instant_queue_capacity.max(1));
        let ledger = CollectionLedger::new(
            store.clone(),
            registry.clone(),
            currency,
            events.clone(),
            metrics.clone(),
        )
        .with_instant_queue(instant_tx);

        let orchestrator = Arc::new(SettlementOrchestrator::new(
            store.clone(),
            rail.clone(),
            RetryStrategy::new(config.retry.clone()),
            config.payment_timeout(),
            events.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            rail,
            events.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(SettlementScheduler::new(
            store.clone(),
            registry.clone(),
            orchestrator.clone(),
            reconciler.clone(),
            config.scheduler_tick(),
            config.reconciliation_interval(),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(
            service = %config.core.service_name,
            currency = %currency.code(),
            "Settlement engine created"
        );

        Ok(Self {
            config,
            store,
            events,
            metrics,
            registry,
            ledger,
            orchestrator,
            reconciler,
            scheduler,
            instant_rx: Mutex::new(Some(instant_rx)),
            shutdown,
        })
    }

    /// Spawn the instant-settlement worker and the scheduler loop.
    ///
    /// Must be called from within a Tokio runtime, once.
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let rx = self
            .instant_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Config("engine already started".to_string()))?;

        let worker = tokio::spawn(self.orchestrator.clone().run_instant_worker(rx));
        let scheduler = tokio::spawn(self.scheduler.clone().start(self.shutdown.subscribe()));

        info!("Settlement engine started");
        Ok(vec![worker, scheduler])
    }

    /// Stop the scheduler loop
    pub fn shutdown(&self) {
        info!("Shutting down settlement engine");
        self.shutdown.send_replace(true);
    }

    /// Stream of engine events
    pub fn subscribe(&self) -> broadcast::Receiver<AtcEvent> {
        self.events.subscribe()
    }

    /// Log every engine event as a JSON line until shutdown
    pub fn log_events(&self) -> JoinHandle<()> {
        tokio::spawn(relay_events(
            self.events.subscribe(),
            self.shutdown.subscribe(),
            |line| info!(target: "atc_events", event = %line, "Settlement update"),
        ))
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn AtcStore> {
        &self.store
    }

    // Grant API

    /// Allow a party to grant without a parent grant
    pub fn register_root_authority(&self, party: PartyId) {
        self.registry.register_root_authority(party);
    }

    /// Create a grant
    pub fn create_grant(&self, req: CreateGrantRequest, now: DateTime<Utc>) -> Result<AtcGrant> {
        Ok(self.registry.create(req, now)?)
    }

    /// Submit a draft grant for approval
    pub fn submit_grant(&self, id: Uuid, now: DateTime<Utc>) -> Result<AtcGrant> {
        Ok(self.registry.submit(id, now)?)
    }

    /// Approve a pending grant
    pub fn approve_grant(&self, id: Uuid, approver: PartyId, now: DateTime<Utc>) -> Result<AtcGrant> {
        Ok(self.registry.approve(id, approver, now)?)
    }

    /// Suspend an active grant
    pub fn suspend_grant(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<AtcGrant> {
        Ok(self.registry.suspend(id, reason, now)?)
    }

    /// Reactivate a suspended grant
    pub fn reinstate_grant(&self, id: Uuid, now: DateTime<Utc>) -> Result<AtcGrant> {
        Ok(self.registry.reinstate(id, now)?)
    }

    /// Revoke a grant, flag its unsettled collections and cancel its open
    /// batches. Initiated payments run to completion.
    pub async fn revoke_grant(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<GrantRevocation> {
        let revocation = self.registry.revoke(id, reason, now)?;
        let cancelled_batches = self
            .orchestrator
            .cancel_open_batches_for_grant(id, &format!("grant revoked: {}", reason), now)
            .await?;
        Ok(GrantRevocation {
            grant: revocation.grant,
            flagged_collections: revocation.flagged,
            cancelled_batches,
        })
    }

    /// Get a grant
    pub fn get_grant(&self, id: Uuid) -> Result<AtcGrant> {
        Ok(self.registry.get(id)?)
    }

    /// Grants issued by a party
    pub fn grants_by_grantor(&self, grantor_id: PartyId) -> Result<Vec<AtcGrant>> {
        Ok(self.registry.list_by_grantor(grantor_id)?)
    }

    /// Grants held by a party
    pub fn grants_by_grantee(&self, grantee_id: PartyId) -> Result<Vec<AtcGrant>> {
        Ok(self.registry.list_by_grantee(grantee_id)?)
    }

    /// Grant tree below `root_id`
    pub fn grant_hierarchy(&self, root_id: Uuid) -> Result<GrantNode> {
        Ok(self.registry.hierarchy(root_id)?)
    }

    /// Most specific active grant for a collection
    pub fn find_applicable_grant(
        &self,
        grantor_id: PartyId,
        grantee_id: PartyId,
        ctx: &OrderContext,
        method: CollectionMethod,
        now: DateTime<Utc>,
    ) -> Result<AtcGrant> {
        Ok(self
            .registry
            .find_applicable(grantor_id, grantee_id, ctx, method, now)?)
    }

    // Collection API

    /// Record a collection
    pub fn record_collection(
        &self,
        req: RecordCollectionRequest,
        now: DateTime<Utc>,
    ) -> Result<AtcCollection> {
        Ok(self.ledger.record_collection(req, now)?)
    }

    /// Would this collection be accepted?
    pub fn verify_authority(
        &self,
        selector: &GrantSelector,
        amount: Decimal,
        method: CollectionMethod,
        ctx: &OrderContext,
        now: DateTime<Utc>,
    ) -> Result<AuthorityCheck> {
        Ok(self
            .ledger
            .verify_authority(selector, amount, method, ctx, now)?)
    }

    /// Get a collection
    pub fn get_collection(&self, id: Uuid) -> Result<AtcCollection> {
        Ok(self.ledger.get_collection(id)?)
    }

    /// Collections of a grant within `[from, to)`
    pub fn collections_by_grant(
        &self,
        grant_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AtcCollection>> {
        Ok(self.ledger.collections_by_grant(grant_id, from, to)?)
    }

    /// Commission earned by a grantee
    pub fn commission_summary(
        &self,
        grantee_id: PartyId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<CommissionSummary> {
        Ok(self.ledger.commission_summary(grantee_id, from, to)?)
    }

    /// Collections made for a grantor
    pub fn collection_summary(
        &self,
        grantor_id: PartyId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<CollectionSummary> {
        Ok(self.ledger.collection_summary(grantor_id, from, to)?)
    }

    // Settlement API

    /// Batch a grant's eligible collections without paying yet
    pub fn create_batch(&self, grant_id: Uuid, now: DateTime<Utc>) -> Result<Option<SettlementBatch>> {
        self.orchestrator.create_batch(grant_id, None, now)
    }

    /// Batch and pay a grant's eligible collections now
    pub async fn settle_now(
        &self,
        grant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementBatch>> {
        self.orchestrator.settle_now(grant_id, now).await
    }

    /// Hand a batch to the rail
    pub async fn initiate_payment(
        &self,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        self.orchestrator.initiate_payment(batch_id, now).await
    }

    /// Rail status callback
    pub fn on_payment_callback(
        &self,
        rail_reference: &str,
        status: PaymentStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        self.orchestrator
            .on_payment_callback(rail_reference, status, reason, now)
    }

    /// Cancel a batch whose payment is not live on the rail
    pub async fn cancel_batch(
        &self,
        batch_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        self.orchestrator.cancel_batch(batch_id, reason, now).await
    }

    /// Close a batch in manual review
    pub fn resolve_manual_review(
        &self,
        batch_id: Uuid,
        resolution: ManualResolution,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        self.orchestrator
            .resolve_manual_review(batch_id, resolution, note, now)
    }

    /// Get a batch
    pub fn get_batch(&self, id: Uuid) -> Result<SettlementBatch> {
        Ok(self.store.require_batch(id)?)
    }

    /// Batches of a grant
    pub fn batches_for_grant(&self, grant_id: Uuid) -> Result<Vec<SettlementBatch>> {
        Ok(self.store.batches_for_grant(grant_id)?)
    }

    /// Unsettled collections and open batches on every grant where `party`
    /// is grantor or grantee
    pub fn pending_settlements(&self, party: PartyId) -> Result<PendingSettlements> {
        let mut grants = self.registry.list_by_grantor(party)?;
        for grant in self.registry.list_by_grantee(party)? {
            if !grants.iter().any(|g| g.id == grant.id) {
                grants.push(grant);
            }
        }

        let mut pending = PendingSettlements::default();
        for grant in &grants {
            pending.collections.extend(
                self.store
                    .collections_for_grant(grant.id)?
                    .into_iter()
                    .filter(|c| {
                        matches!(
                            c.settlement_status,
                            SettlementStatus::Pending
                                | SettlementStatus::Scheduled
                                | SettlementStatus::Processing
                        )
                    }),
            );
            pending.batches.extend(
                self.store
                    .batches_for_grant(grant.id)?
                    .into_iter()
                    .filter(|b| !b.status.is_terminal()),
            );
        }
        pending.collections.sort_by_key(|c| c.collected_at);
        pending.batches.sort_by_key(|b| b.created_at);
        Ok(pending)
    }

    /// Run one scheduler tick now
    pub async fn run_scheduler_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler.run_once(now).await
    }

    /// Run reconciliation now
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        self.reconciler.run(now).await
    }

    /// Recorded discrepancies
    pub fn discrepancies(&self, open_only: bool) -> Result<Vec<ReconciliationDiscrepancy>> {
        self.reconciler.discrepancies(open_only)
    }

    /// Close a discrepancy
    pub fn resolve_discrepancy(
        &self,
        id: Uuid,
        notes: Option<String>,
    ) -> Result<ReconciliationDiscrepancy> {
        self.reconciler.resolve_discrepancy(id, notes)
    }
}

/// Hand each event to `sink` as JSON until `shutdown` flips to true
async fn relay_events(
    mut events: broadcast::Receiver<AtcEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut sink: impl FnMut(String) + Send,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => match event.to_json() {
                    Ok(line) => sink(line),
                    Err(e) => warn!(error = %e, "Event not serialisable"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::MockPaymentRail;

    #[tokio::test]
    async fn test_engine_creation_memory() {
        let engine = SettlementEngine::new(Config::default(), Arc::new(MockPaymentRail::new())).unwrap();
        assert_eq!(engine.config().core.service_name, "atc-engine");
        assert!(engine.store().list_grants().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_creation_rocksdb() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.core.storage = StorageBackend::Rocksdb;
        config.core.data_dir = temp_dir.path().join("atc");

        let engine = SettlementEngine::new(config, Arc::new(MockPaymentRail::new())).unwrap();
        assert!(engine.store().list_batches().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_once() {
        let engine = SettlementEngine::new(Config::default(), Arc::new(MockPaymentRail::new())).unwrap();
        let handles = engine.start().unwrap();
        assert_eq!(handles.len(), 2);
        assert!(matches!(engine.start(), Err(Error::Config(_))));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_relay_writes_json_lines_until_shutdown() {
        let engine = SettlementEngine::new(Config::default(), Arc::new(MockPaymentRail::new())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_events(
            engine.subscribe(),
            engine.shutdown.subscribe(),
            move |line| {
                let _ = tx.send(line);
            },
        ));

        engine.events.emit(AtcEvent::GrantSuspended {
            grant_id: Uuid::nil(),
            reason: "audit".into(),
        });
        let line = rx.recv().await.unwrap();
        assert!(line.contains("\"type\":\"GRANT_SUSPENDED\""));

        engine.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
    }
}
