//! Property-based tests for ATC invariants
//!
//! - Commission determinism: same terms and gross give the same split
//! - Split conservation: commission + net == gross, 0 <= commission <= gross
//! - Clamp respect: commission stays inside [min, max] unless capped at gross
//! - Limit safety: cumulative never exceeds the cap, even under contention

use atc_core::{
    config::GrantPolicy,
    ledger::{GrantSelector, RecordCollectionRequest},
    types::{
        CommissionTerms, CommissionTier, MethodFilter, OrderContext, OrderRef, Payer,
        SettlementAccount, SettlementFrequency, SettlementTerms,
    },
    AtcGrant, AtcStore, CollectionLedger, CollectionMethod, CommissionCalculator,
    CreateGrantRequest, Currency, Error, EventBus, GrantRegistry, GrantScope, MemoryStore,
    Metrics, PartyId, PartyType,
};
use chrono::{Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Amounts with two decimal places
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000_00i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Percentage rates with up to two decimal places
fn rate_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=10_000i64).prop_map(|bp| Decimal::new(bp, 2))
}

fn terms_strategy() -> impl Strategy<Value = CommissionTerms> {
    prop_oneof![
        rate_strategy().prop_map(CommissionTerms::percentage),
        amount_strategy().prop_map(CommissionTerms::flat),
        (amount_strategy(), rate_strategy()).prop_map(|(f, r)| CommissionTerms::hybrid(f, r)),
        (rate_strategy(), rate_strategy()).prop_map(|(low, high)| {
            CommissionTerms::tiered(vec![
                CommissionTier::new(Decimal::ZERO, Some(Decimal::from(50_000)), low),
                CommissionTier::new(Decimal::from(50_000), None, high),
            ])
        }),
    ]
}

struct Harness {
    ledger: CollectionLedger,
    registry: Arc<GrantRegistry>,
    store: Arc<dyn AtcStore>,
    grantor: PartyId,
}

fn harness() -> Harness {
    let store: Arc<dyn AtcStore> = Arc::new(MemoryStore::new());
    let grantor = PartyId::random();
    let events = EventBus::default();
    let metrics = Metrics::new().unwrap();
    let registry = Arc::new(GrantRegistry::new(
        store.clone(),
        GrantPolicy {
            root_authorities: vec![grantor],
            ..Default::default()
        },
        Currency::KES,
        events.clone(),
        metrics.clone(),
    ));
    let ledger = CollectionLedger::new(store.clone(), registry.clone(), Currency::KES, events, metrics);
    Harness {
        ledger,
        registry,
        store,
        grantor,
    }
}

fn active_grant(h: &Harness, limit: Decimal) -> AtcGrant {
    let now = Utc::now();
    let req = CreateGrantRequest {
        grantor_id: h.grantor,
        grantor_type: PartyType::Manufacturer,
        grantor_name: "Acme".into(),
        grantee_id: PartyId::random(),
        grantee_type: PartyType::Worker,
        grantee_name: "Agent".into(),
        scope: GrantScope::AllProducts,
        methods: MethodFilter::All,
        max_per_transaction: None,
        cumulative_limit: Some(limit),
        commission: CommissionTerms::percentage(Decimal::from(3)),
        settlement: SettlementTerms {
            frequency: SettlementFrequency::OnDemand,
            delay_days: 0,
            settlement_day: 0,
            account: SettlementAccount::bank("01", "12345", "Acme"),
        },
        effective_from: now - Duration::days(1),
        effective_to: None,
        parent_grant_id: None,
        terms_document_url: None,
    };
    let grant = h.registry.create(req, now).unwrap();
    h.registry.submit(grant.id, now).unwrap();
    h.registry.approve(grant.id, h.grantor, now).unwrap()
}

fn collect(grant: &AtcGrant, amount: Decimal) -> RecordCollectionRequest {
    RecordCollectionRequest {
        grant: GrantSelector::Id(grant.id),
        payer: Payer {
            id: PartyId::random(),
            party_type: PartyType::Retailer,
            name: "Shop".into(),
        },
        amount,
        method: CollectionMethod::Cash,
        order_ref: OrderRef::default(),
        context: OrderContext::default(),
        payment_reference: None,
        collected_by: None,
        notes: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the split is a pure function of terms and gross
    #[test]
    fn prop_commission_deterministic(terms in terms_strategy(), gross in amount_strategy()) {
        let calc = CommissionCalculator::new(2);
        let a = calc.calculate(&terms, gross);
        let b = calc.calculate(&terms, gross);
        prop_assert_eq!(a.ok(), b.ok());
    }

    /// Property: commission + net == gross and the commission fits in gross
    #[test]
    fn prop_split_conserves_gross(terms in terms_strategy(), gross in amount_strategy()) {
        let split = CommissionCalculator::new(2).calculate(&terms, gross).unwrap();
        prop_assert_eq!(split.commission + split.net, gross);
        prop_assert!(split.commission >= Decimal::ZERO);
        prop_assert!(split.commission <= gross);
        prop_assert!(split.commission.normalize().scale() <= 2);
    }

    /// Property: hybrid commission respects its clamps
    #[test]
    fn prop_hybrid_clamped(
        flat in amount_strategy(),
        rate in rate_strategy(),
        gross in amount_strategy(),
        min_cents in 0i64..10_000,
        span_cents in 0i64..10_000,
    ) {
        let min = Decimal::new(min_cents, 2);
        let max = min + Decimal::new(span_cents, 2);
        let terms = CommissionTerms::hybrid(flat, rate).with_bounds(Some(min), Some(max));
        let split = CommissionCalculator::new(2).calculate(&terms, gross).unwrap();

        if split.capped_at_gross {
            prop_assert_eq!(split.commission, gross);
        } else {
            prop_assert!(split.commission >= min);
            prop_assert!(split.commission <= max);
        }
    }

    /// Property: accepted collections never push cumulative past the cap
    #[test]
    fn prop_cumulative_never_exceeds_limit(
        amounts in prop::collection::vec(1i64..5_000i64, 1..40),
        limit in 1_000i64..50_000i64,
    ) {
        let h = harness();
        let grant = active_grant(&h, Decimal::from(limit));

        let mut accepted = Decimal::ZERO;
        for amount in amounts {
            let amount = Decimal::from(amount);
            match h.ledger.record_collection(collect(&grant, amount), Utc::now()) {
                Ok(_) => accepted += amount,
                Err(Error::LimitExceeded(_)) => {}
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }

        let stored = h.store.require_grant(grant.id).unwrap();
        prop_assert_eq!(stored.cumulative_collected, accepted);
        prop_assert!(stored.cumulative_collected <= Decimal::from(limit));

        let total: Decimal = h
            .store
            .collections_for_grant(grant.id)
            .unwrap()
            .iter()
            .map(|c| c.gross_amount)
            .sum();
        prop_assert_eq!(total, accepted);
    }
}

#[test]
fn test_concurrent_collections_respect_limit() {
    let h = Arc::new(harness());
    let grant = active_grant(&h, Decimal::from(10_000));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let h = h.clone();
            let grant = grant.clone();
            std::thread::spawn(move || {
                let mut ok = 0u32;
                for _ in 0..50 {
                    if h
                        .ledger
                        .record_collection(collect(&grant, Decimal::from(25)), Utc::now())
                        .is_ok()
                    {
                        ok += 1;
                    }
                }
                ok
            })
        })
        .collect();

    let accepted: u32 = handles.into_iter().map(|t| t.join().unwrap()).sum();

    // 16 * 50 * 25 = 20_000 attempted against a 10_000 cap
    assert_eq!(accepted, 400);
    let stored = h.store.require_grant(grant.id).unwrap();
    assert_eq!(stored.cumulative_collected, Decimal::from(10_000));
    assert_eq!(h.store.collections_for_grant(grant.id).unwrap().len(), 400);
}

#[test]
fn test_worked_tiered_example() {
    let h = harness();
    let now = Utc::now();
    let req = CreateGrantRequest {
        grantor_id: h.grantor,
        grantor_type: PartyType::Manufacturer,
        grantor_name: "Acme".into(),
        grantee_id: PartyId::random(),
        grantee_type: PartyType::Distributor,
        grantee_name: "Rift".into(),
        scope: GrantScope::AllProducts,
        methods: MethodFilter::All,
        max_per_transaction: None,
        cumulative_limit: Some(Decimal::from(100_000)),
        commission: CommissionTerms::tiered(vec![
            CommissionTier::new(Decimal::ZERO, Some(Decimal::from(50_000)), Decimal::from(5)),
            CommissionTier::new(Decimal::from(50_000), None, Decimal::from(3)),
        ]),
        settlement: SettlementTerms {
            frequency: SettlementFrequency::Weekly,
            delay_days: 0,
            settlement_day: 4,
            account: SettlementAccount::bank("01", "12345", "Acme"),
        },
        effective_from: now - Duration::days(1),
        effective_to: None,
        parent_grant_id: None,
        terms_document_url: None,
    };
    let grant = h.registry.create(req, now).unwrap();
    h.registry.submit(grant.id, now).unwrap();
    let grant = h.registry.approve(grant.id, h.grantor, now).unwrap();

    let first = h
        .ledger
        .record_collection(collect(&grant, Decimal::from(30_000)), now)
        .unwrap();
    assert_eq!(first.commission_amount, Decimal::from(1_500));
    assert_eq!(first.net_amount, Decimal::from(28_500));

    let second = h
        .ledger
        .record_collection(collect(&grant, Decimal::from(60_000)), now)
        .unwrap();
    assert_eq!(second.commission_amount, Decimal::from(1_800));
    assert_eq!(second.net_amount, Decimal::from(58_200));
    assert_eq!(
        h.store.require_grant(grant.id).unwrap().cumulative_collected,
        Decimal::from(90_000)
    );

    let third = h
        .ledger
        .record_collection(collect(&grant, Decimal::from(120_000)), now);
    assert!(matches!(third, Err(Error::LimitExceeded(_))));
    assert_eq!(
        h.store.require_grant(grant.id).unwrap().cumulative_collected,
        Decimal::from(90_000)
    );
}
