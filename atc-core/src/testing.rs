//! Fixtures shared by unit tests

use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub(crate) fn active_grant(now: DateTime<Utc>) -> AtcGrant {
    let id = Uuid::now_v7();
    AtcGrant {
        id,
        reference: short_reference("ATC", id),
        currency: Currency::KES,
        grantor_id: PartyId::random(),
        grantor_type: PartyType::Manufacturer,
        grantor_name: "Acme Foods".into(),
        grantee_id: PartyId::random(),
        grantee_type: PartyType::Distributor,
        grantee_name: "Rift Distributors".into(),
        scope: GrantScope::AllProducts,
        methods: MethodFilter::All,
        max_per_transaction: None,
        cumulative_limit: None,
        cumulative_collected: Decimal::ZERO,
        commission: CommissionTerms::percentage(Decimal::from(5)),
        settlement: SettlementTerms {
            frequency: SettlementFrequency::Daily,
            delay_days: 0,
            settlement_day: 0,
            account: SettlementAccount::bank("01", "0011223344", "Acme Foods"),
        },
        status: GrantStatus::Active,
        effective_from: now - Duration::days(1),
        effective_to: None,
        status_reason: None,
        parent_grant_id: None,
        approved_by: None,
        approved_at: None,
        terms_document_url: None,
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

pub(crate) fn collection_for(grant: &AtcGrant, gross: Decimal, now: DateTime<Utc>) -> AtcCollection {
    let id = Uuid::now_v7();
    let commission = gross * Decimal::from(5) / Decimal::ONE_HUNDRED;
    AtcCollection {
        id,
        reference: AtcCollection::new_reference(id),
        grant_id: grant.id,
        grantor_id: grant.grantor_id,
        grantee_id: grant.grantee_id,
        collected_from: Payer {
            id: PartyId::random(),
            party_type: PartyType::Retailer,
            name: "Mama Mboga".into(),
        },
        method: CollectionMethod::Cash,
        payment_reference: None,
        order_ref: OrderRef::default(),
        collected_by: None,
        notes: None,
        gross_amount: gross,
        commission_amount: commission,
        net_amount: gross - commission,
        settlement_status: SettlementStatus::Pending,
        settlement_batch_id: None,
        settled_at: None,
        needs_reconciliation: false,
        collected_at: now,
        version: 0,
    }
}

pub(crate) fn batch_for(grant: &AtcGrant, ids: &[Uuid], now: DateTime<Utc>) -> SettlementBatch {
    let id = Uuid::now_v7();
    SettlementBatch {
        id,
        reference: SettlementBatch::new_reference(id),
        grant_id: grant.id,
        grantor_id: grant.grantor_id,
        destination: grant.settlement.account.destination().unwrap_or_default(),
        currency: grant.currency,
        period_start: now - Duration::days(1),
        period_end: now,
        collection_ids: ids.to_vec(),
        total_gross: Decimal::ZERO,
        total_commission: Decimal::ZERO,
        total_net: Decimal::ZERO,
        transaction_count: 0,
        status: BatchStatus::Batched,
        payment_status: PaymentStatus::Pending,
        reconciliation_status: ReconciliationStatus::Unreconciled,
        idempotency_key: SettlementBatch::idempotency_key_for(id),
        attempts: 0,
        next_retry_at: None,
        rail_reference: None,
        failure_reason: None,
        created_at: now,
        initiated_at: None,
        settled_at: None,
        version: 0,
    }
}
