//! End-to-end tests through the settlement engine facade

use atc_core::ledger::{GrantSelector, RecordCollectionRequest};
use atc_core::types::{
    CommissionTerms, CommissionTier, DiscrepancyKind, MethodFilter, OrderContext, OrderRef, Payer,
    PaymentStatus, SettlementAccount, SettlementFrequency, SettlementTerms,
};
use atc_core::{
    AtcEvent, AtcGrant, BatchStatus, CollectionMethod, CreateGrantRequest, GrantScope, PartyId,
    PartyType, SettlementStatus,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use settlement::{Config, Error, ManualResolution, MockPaymentRail, SettlementEngine};
use std::sync::Arc;

struct Setup {
    engine: SettlementEngine,
    rail: Arc<MockPaymentRail>,
    root: PartyId,
}

fn setup_with(config: Config) -> Setup {
    let rail = Arc::new(MockPaymentRail::new());
    let engine = SettlementEngine::new(config, rail.clone()).unwrap();
    let root = PartyId::random();
    engine.register_root_authority(root);
    Setup { engine, rail, root }
}

fn setup() -> Setup {
    setup_with(Config::default())
}

fn request(root: PartyId, frequency: SettlementFrequency, now: DateTime<Utc>) -> CreateGrantRequest {
    CreateGrantRequest {
        grantor_id: root,
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
            delay_days: 0,
            settlement_day: 0,
            account: SettlementAccount::bank("01", "0011223344", "Acme Foods"),
        },
        effective_from: now - Duration::days(1),
        effective_to: None,
        parent_grant_id: None,
        terms_document_url: None,
    }
}

fn activate(s: &Setup, req: CreateGrantRequest, now: DateTime<Utc>) -> AtcGrant {
    let grant = s.engine.create_grant(req, now).unwrap();
    s.engine.submit_grant(grant.id, now).unwrap();
    s.engine.approve_grant(grant.id, s.root, now).unwrap()
}

fn collection(grant: &AtcGrant, amount: i64) -> RecordCollectionRequest {
    RecordCollectionRequest {
        grant: GrantSelector::Id(grant.id),
        payer: Payer {
            id: PartyId::random(),
            party_type: PartyType::Retailer,
            name: "Duka La Mama".into(),
        },
        amount: Decimal::from(amount),
        method: CollectionMethod::MobileMoney,
        order_ref: OrderRef::default(),
        context: OrderContext::default(),
        payment_reference: None,
        collected_by: None,
        notes: None,
    }
}

#[tokio::test]
async fn test_collect_batch_settle() {
    let s = setup();
    let now = Utc::now();
    let mut req = request(s.root, SettlementFrequency::OnDemand, now);
    req.cumulative_limit = Some(Decimal::from(100_000));
    req.commission = CommissionTerms::tiered(vec![
        CommissionTier::new(Decimal::ZERO, Some(Decimal::from(50_000)), Decimal::from(5)),
        CommissionTier::new(Decimal::from(50_000), None, Decimal::from(3)),
    ]);
    let grant = activate(&s, req, now);

    s.engine
        .record_collection(collection(&grant, 30_000), now)
        .unwrap();
    s.engine
        .record_collection(collection(&grant, 60_000), now)
        .unwrap();
    let over = s.engine.record_collection(collection(&grant, 120_000), now);
    assert!(matches!(
        over,
        Err(Error::Core(atc_core::Error::LimitExceeded(_)))
    ));

    let summary = s
        .engine
        .commission_summary(grant.grantee_id, None, None)
        .unwrap();
    assert_eq!(summary.collection_count, 2);
    assert_eq!(summary.total_commission, Decimal::from(3_300));
    assert_eq!(summary.total_net, Decimal::from(86_700));

    let batch = s.engine.settle_now(grant.id, now).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::PaymentInitiated);
    assert_eq!(batch.total_net, Decimal::from(86_700));
    assert_eq!(batch.transaction_count, 2);

    let reference = batch.rail_reference.clone().unwrap();
    let settled = s
        .engine
        .on_payment_callback(&reference, PaymentStatus::Settled, None, now)
        .unwrap();
    assert_eq!(settled.status, BatchStatus::Settled);

    for c in s.engine.collections_by_grant(grant.id, None, None).unwrap() {
        assert_eq!(c.settlement_status, SettlementStatus::Settled);
        assert_eq!(c.settlement_batch_id, Some(batch.id));
    }

    let grantor = s
        .engine
        .collection_summary(grant.grantor_id, None, None)
        .unwrap();
    assert_eq!(grantor.settled_net, Decimal::from(86_700));
    assert_eq!(grantor.outstanding_net, Decimal::ZERO);

    // Nothing left to batch
    assert!(s.engine.settle_now(grant.id, now).await.unwrap().is_none());

    let report = s.engine.reconcile(now).await.unwrap();
    assert!(report.discrepancies.is_empty());
    assert_eq!(report.batches_checked, 1);
}

#[tokio::test]
async fn test_retried_payment_reuses_idempotency_key() {
    let s = setup();
    let now = Utc::now();
    let grant = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);
    s.engine.record_collection(collection(&grant, 1_000), now).unwrap();

    let batch = s.engine.settle_now(grant.id, now).await.unwrap().unwrap();
    let first_reference = batch.rail_reference.clone().unwrap();

    // Initiating again is a no-op
    let again = s.engine.initiate_payment(batch.id, now).await.unwrap();
    assert_eq!(again.attempts, 1);
    assert_eq!(s.rail.call_count(), 1);

    // No confirmation: the tick fails the payment and schedules a retry
    let later = now + Duration::minutes(5);
    let report = s.engine.run_scheduler_tick(later).await.unwrap();
    assert_eq!(report.timed_out, vec![batch.id]);
    let failed = s.engine.get_batch(batch.id).unwrap();
    assert_eq!(failed.status, BatchStatus::Batched);
    assert!(failed.next_retry_at.is_some());

    // The retry hits the rail with the same key and gets the same payment
    let report = s
        .engine
        .run_scheduler_tick(later + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.retried, 1);
    let retried = s.engine.get_batch(batch.id).unwrap();
    assert_eq!(retried.status, BatchStatus::PaymentInitiated);
    assert_eq!(retried.attempts, 2);
    assert_eq!(retried.rail_reference.as_deref(), Some(first_reference.as_str()));
    assert_eq!(s.rail.call_count(), 2);
    assert_eq!(s.rail.payment_count(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_escalate_to_manual_review() {
    let s = setup();
    let now = Utc::now();
    let grant = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);
    let c = s.engine.record_collection(collection(&grant, 2_000), now).unwrap();

    for _ in 0..4 {
        s.rail.fail_next("bank unavailable");
    }

    let batch = s.engine.settle_now(grant.id, now).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Batched);
    assert_eq!(batch.attempts, 1);

    for hour in 1..=3 {
        s.engine
            .run_scheduler_tick(now + Duration::hours(hour))
            .await
            .unwrap();
    }

    let escalated = s.engine.get_batch(batch.id).unwrap();
    assert_eq!(escalated.status, BatchStatus::ManualReview);
    assert_eq!(escalated.attempts, 4);
    assert_eq!(
        s.engine.get_collection(c.id).unwrap().settlement_status,
        SettlementStatus::Disputed
    );

    let open = s.engine.discrepancies(true).unwrap();
    assert!(open
        .iter()
        .any(|d| d.kind == DiscrepancyKind::PaymentEscalated && d.subject_id == batch.id));

    // Not cancellable directly from review
    assert!(s.engine.cancel_batch(batch.id, "operator", now).await.is_err());

    let released = s
        .engine
        .resolve_manual_review(
            batch.id,
            ManualResolution::Release,
            Some("bank confirmed no funds moved".into()),
            now,
        )
        .unwrap();
    assert_eq!(released.status, BatchStatus::Cancelled);

    let c = s.engine.get_collection(c.id).unwrap();
    assert_eq!(c.settlement_status, SettlementStatus::Pending);
    assert_eq!(c.settlement_batch_id, None);
    assert!(s
        .engine
        .discrepancies(true)
        .unwrap()
        .iter()
        .all(|d| d.subject_id != batch.id));

    // Released money batches again
    let rebatched = s.engine.create_batch(grant.id, now).unwrap().unwrap();
    assert_ne!(rebatched.id, batch.id);
    assert_eq!(rebatched.collection_ids, vec![c.id]);
}

#[tokio::test]
async fn test_revocation_cancels_open_batches_and_still_settles() {
    let s = setup();
    let now = Utc::now();
    let grant = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);

    s.engine.record_collection(collection(&grant, 1_000), now).unwrap();
    s.engine.record_collection(collection(&grant, 2_000), now).unwrap();
    let open = s.engine.create_batch(grant.id, now).unwrap().unwrap();
    s.engine.record_collection(collection(&grant, 3_000), now).unwrap();

    let revocation = s.engine.revoke_grant(grant.id, "contract ended", now).await.unwrap();
    assert_eq!(revocation.cancelled_batches, vec![open.id]);
    assert_eq!(revocation.flagged_collections.len(), 3);
    assert_eq!(
        s.engine.get_batch(open.id).unwrap().status,
        BatchStatus::Cancelled
    );

    // No new collections under a revoked grant
    assert!(s
        .engine
        .record_collection(collection(&grant, 500), now)
        .is_err());

    // Money already collected is still owed to the grantor
    let batch = s.engine.settle_now(grant.id, now).await.unwrap().unwrap();
    assert_eq!(batch.transaction_count, 3);
    assert_eq!(batch.total_gross, Decimal::from(6_000));
    s.engine
        .on_payment_callback(
            batch.rail_reference.as_deref().unwrap(),
            PaymentStatus::Settled,
            None,
            now,
        )
        .unwrap();

    let report = s.engine.reconcile(now).await.unwrap();
    assert_eq!(report.flags_cleared, 3);
    assert!(report.discrepancies.is_empty());
}

#[tokio::test]
async fn test_cancel_returns_collections_to_pending() {
    let s = setup();
    let now = Utc::now();
    let grant = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);
    let c = s.engine.record_collection(collection(&grant, 1_000), now).unwrap();

    let batch = s.engine.create_batch(grant.id, now).unwrap().unwrap();
    assert_eq!(
        s.engine.get_collection(c.id).unwrap().settlement_status,
        SettlementStatus::Scheduled
    );

    let cancelled = s.engine.cancel_batch(batch.id, "wrong account", now).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert_eq!(cancelled.failure_reason.as_deref(), Some("wrong account"));
    assert!(s.engine.initiate_payment(batch.id, now).await.is_err());

    let c = s.engine.get_collection(c.id).unwrap();
    assert_eq!(c.settlement_status, SettlementStatus::Pending);
    assert!(c.settlement_batch_id.is_none());
    assert_eq!(s.engine.batches_for_grant(grant.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_instant_grant_settles_in_background() {
    let s = setup();
    let now = Utc::now();
    let grant = activate(&s, request(s.root, SettlementFrequency::Instant, now), now);

    let mut events = s.engine.subscribe();
    let _handles = s.engine.start().unwrap();
    let c = s
        .engine
        .record_collection(collection(&grant, 4_000), Utc::now())
        .unwrap();

    let batch_id = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let AtcEvent::PaymentInitiated { batch_id, .. } = events.recv().await.unwrap() {
                return batch_id;
            }
        }
    })
    .await
    .unwrap();

    let batch = s.engine.get_batch(batch_id).unwrap();
    assert_eq!(batch.grant_id, grant.id);
    assert_eq!(batch.collection_ids, vec![c.id]);
    assert_eq!(
        s.engine.get_collection(c.id).unwrap().settlement_status,
        SettlementStatus::Processing
    );
    s.engine.shutdown();
}

#[tokio::test]
async fn test_concurrent_collections_never_exceed_limit() {
    let s = Arc::new(setup());
    let now = Utc::now();
    let mut req = request(s.root, SettlementFrequency::OnDemand, now);
    req.cumulative_limit = Some(Decimal::from(10_000));
    let grant = activate(&s, req, now);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let s = s.clone();
        let grant = grant.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            (0..100)
                .filter(|_| s.engine.record_collection(collection(&grant, 25), now).is_ok())
                .count()
        }));
    }
    let mut accepted = 0;
    for t in tasks {
        accepted += t.await.unwrap();
    }

    assert_eq!(accepted, 400);
    let stored = s.engine.get_grant(grant.id).unwrap();
    assert_eq!(stored.cumulative_collected, Decimal::from(10_000));
    assert!(s.engine.reconcile(now).await.unwrap().discrepancies.is_empty());
}

#[tokio::test]
async fn test_rocksdb_engine_survives_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.core.storage = atc_core::config::StorageBackend::Rocksdb;
    config.core.data_dir = temp_dir.path().join("atc");
    let now = Utc::now();

    let (grant_id, batch_id) = {
        let s = setup_with(config.clone());
        let grant = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);
        s.engine.record_collection(collection(&grant, 5_000), now).unwrap();
        let batch = s.engine.settle_now(grant.id, now).await.unwrap().unwrap();
        (grant.id, batch.id)
    };

    let s = setup_with(config);
    let grant = s.engine.get_grant(grant_id).unwrap();
    assert_eq!(grant.cumulative_collected, Decimal::from(5_000));

    let batch = s.engine.get_batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::PaymentInitiated);
    assert_eq!(batch.total_net, Decimal::from(4_750));

    // The restarted rail has never seen the payment, so the timeout path
    // fails it and leaves it for retry rather than losing it
    let report = s
        .engine
        .run_scheduler_tick(now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![batch_id]);
    assert_eq!(
        s.engine.get_batch(batch_id).unwrap().status,
        BatchStatus::Batched
    );
}

#[tokio::test]
async fn test_pending_settlements_for_grantor_and_grantee() {
    let s = setup();
    let now = Utc::now();
    let first = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);
    let second = activate(&s, request(s.root, SettlementFrequency::OnDemand, now), now);

    let a = s.engine.record_collection(collection(&first, 1_000), now).unwrap();
    let b = s.engine.record_collection(collection(&first, 2_000), now).unwrap();
    let in_flight = s.engine.settle_now(first.id, now).await.unwrap().unwrap();
    let c = s.engine.record_collection(collection(&first, 3_000), now).unwrap();

    // Fully settled grant contributes nothing
    s.engine.record_collection(collection(&second, 500), now).unwrap();
    let paid = s.engine.settle_now(second.id, now).await.unwrap().unwrap();
    s.engine
        .on_payment_callback(
            paid.rail_reference.as_deref().unwrap(),
            PaymentStatus::Settled,
            None,
            now,
        )
        .unwrap();

    let for_grantor = s.engine.pending_settlements(s.root).unwrap();
    let mut ids: Vec<_> = for_grantor.collections.iter().map(|c| c.id).collect();
    ids.sort();
    let mut expected = vec![a.id, b.id, c.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(for_grantor.batches.len(), 1);
    assert_eq!(for_grantor.batches[0].id, in_flight.id);
    assert_eq!(for_grantor.total_net(), Decimal::from(5_700));

    let for_grantee = s.engine.pending_settlements(first.grantee_id).unwrap();
    assert_eq!(for_grantee.collections.len(), 3);
    assert_eq!(for_grantee.batches.len(), 1);

    let settled_grantee = s.engine.pending_settlements(second.grantee_id).unwrap();
    assert!(settled_grantee.collections.is_empty());
    assert!(settled_grantee.batches.is_empty());

    let stranger = s.engine.pending_settlements(PartyId::random()).unwrap();
    assert!(stranger.collections.is_empty() && stranger.batches.is_empty());
}

#[tokio::test]
async fn test_scheduler_sweeps_instant_collections_dropped_from_full_queue() {
    let mut config = Config::default();
    config.instant_queue_capacity = 1;
    let s = setup_with(config);
    let now = Utc::now();
    let grant = activate(&s, request(s.root, SettlementFrequency::Instant, now), now);

    // No worker is running, so the second hand-off finds the queue full
    let first = s.engine.record_collection(collection(&grant, 1_000), now).unwrap();
    let second = s.engine.record_collection(collection(&grant, 1_000), now).unwrap();

    let report = s.engine.run_scheduler_tick(now).await.unwrap();
    assert_eq!(report.batches_created.len(), 1);
    assert_eq!(report.initiated, 1);

    let batch = s.engine.get_batch(report.batches_created[0]).unwrap();
    assert_eq!(batch.status, BatchStatus::PaymentInitiated);
    let mut members = batch.collection_ids.clone();
    members.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(members, expected);
    assert_eq!(s.rail.payment_count(), 1);
}
