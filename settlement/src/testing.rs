//! Fixtures shared by unit tests

use atc_core::config::GrantPolicy;
use atc_core::ledger::{GrantSelector, RecordCollectionRequest};
use atc_core::types::*;
use atc_core::{
    AtcStore, CollectionLedger, CreateGrantRequest, EventBus, GrantRegistry, MemoryStore, Metrics,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

pub(crate) struct Fixture {
    pub store: Arc<dyn AtcStore>,
    pub events: EventBus,
    pub metrics: Metrics,
    pub registry: Arc<GrantRegistry>,
    pub ledger: CollectionLedger,
    pub root: PartyId,
}

impl Fixture {
    pub fn new() -> Self {
        let store: Arc<dyn AtcStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new(256);
        let metrics = Metrics::new().unwrap();
        let root = PartyId::random();
        let registry = Arc::new(GrantRegistry::new(
            store.clone(),
            GrantPolicy {
                root_authorities: vec![root],
                ..Default::default()
            },
            Currency::KES,
            events.clone(),
            metrics.clone(),
        ));
        let ledger = CollectionLedger::new(
            store.clone(),
            registry.clone(),
            Currency::KES,
            events.clone(),
            metrics.clone(),
        );
        Self {
            store,
            events,
            metrics,
            registry,
            ledger,
            root,
        }
    }

    pub fn grant_with_delay(&self, delay_days: u32) -> AtcGrant {
        self.grant(SettlementFrequency::Daily, 0, delay_days)
    }

    pub fn grant(
        &self,
        frequency: SettlementFrequency,
        settlement_day: u32,
        delay_days: u32,
    ) -> AtcGrant {
        let now = Utc::now();
        let req = CreateGrantRequest {
            grantor_id: self.root,
            grantor_type: PartyType::Manufacturer,
            grantor_name: "Acme Foods".into(),
            grantee_id: PartyId::random(),
            grantee_type: PartyType::Distributor,
            grantee_name: "Rift Distributors".into(),
            scope: GrantScope::AllProducts,
            methods: MethodFilter::All,
            max_per_transaction: None,
            cumulative_limit: None,
            commission: CommissionTerms::percentage(Decimal::from(5)),
            settlement: SettlementTerms {
                frequency,
                delay_days,
                settlement_day,
                account: SettlementAccount::bank("01", "0011223344", "Acme Foods"),
            },
            effective_from: now - Duration::days(30),
            effective_to: None,
            parent_grant_id: None,
            terms_document_url: None,
        };
        let grant = self.registry.create(req, now).unwrap();
        self.registry.submit(grant.id, now).unwrap();
        self.registry.approve(grant.id, self.root, now).unwrap()
    }

    pub fn collect(&self, grant: &AtcGrant, amount: i64) -> AtcCollection {
        self.ledger
            .record_collection(
                RecordCollectionRequest {
                    grant: GrantSelector::Id(grant.id),
                    payer: Payer {
                        id: PartyId::random(),
                        party_type: PartyType::Retailer,
                        name: "Mama Mboga".into(),
                    },
                    amount: Decimal::from(amount),
                    method: CollectionMethod::Cash,
                    order_ref: OrderRef::default(),
                    context: OrderContext::default(),
                    payment_reference: None,
                    collected_by: None,
                    notes: None,
                },
                Utc::now(),
            )
            .unwrap()
    }
}
