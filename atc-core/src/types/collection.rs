//! Collections: immutable records of money collected under a grant

use super::{short_reference, CollectionMethod, PartyId, PartyType};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Settlement progress of a single collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SettlementStatus {
    /// Waiting to be batched
    Pending = 1,
    /// Claimed by a settlement batch
    Scheduled = 2,
    /// Payment in flight
    Processing = 3,
    /// Paid to the grantor (terminal)
    Settled = 4,
    /// Payment failed
    Failed = 5,
    /// Escalated for human review
    Disputed = 6,
}

impl SettlementStatus {
    /// Transition table
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, Processing)
                | (Scheduled, Pending)
                | (Processing, Settled)
                | (Processing, Scheduled)
                | (Processing, Failed)
                | (Processing, Disputed)
                | (Scheduled, Disputed)
                | (Failed, Pending)
                | (Disputed, Pending)
                | (Disputed, Settled)
        )
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Scheduled => "SCHEDULED",
            SettlementStatus::Processing => "PROCESSING",
            SettlementStatus::Settled => "SETTLED",
            SettlementStatus::Failed => "FAILED",
            SettlementStatus::Disputed => "DISPUTED",
        };
        f.write_str(s)
    }
}

/// Who paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    /// Paying party
    pub id: PartyId,
    /// Role (metadata)
    pub party_type: PartyType,
    /// Display name
    pub name: String,
}

/// Order or invoice a collection pays for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    /// Order
    pub order_id: Option<Uuid>,
    /// Invoice
    pub invoice_id: Option<Uuid>,
}

/// Money collected under a grant.
///
/// Gross, commission and net never change after creation; only the
/// settlement fields move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtcCollection {
    /// Collection ID
    pub id: Uuid,
    /// Human-readable reference
    pub reference: String,
    /// Grant collected under
    pub grant_id: Uuid,
    /// Grantor owed the net amount
    pub grantor_id: PartyId,
    /// Grantee who collected
    pub grantee_id: PartyId,

    /// Payer
    pub collected_from: Payer,
    /// Rail used
    pub method: CollectionMethod,
    /// External payment reference (mobile-money receipt, cheque number...)
    pub payment_reference: Option<String>,
    /// Linked order/invoice
    pub order_ref: OrderRef,
    /// Worker who physically collected
    pub collected_by: Option<PartyId>,
    /// Free-form notes
    pub notes: Option<String>,

    /// Amount collected
    pub gross_amount: Decimal,
    /// Commission kept by the grantee
    pub commission_amount: Decimal,
    /// Amount owed to the grantor
    pub net_amount: Decimal,

    /// Settlement progress
    pub settlement_status: SettlementStatus,
    /// Batch currently holding this collection
    pub settlement_batch_id: Option<Uuid>,
    /// When the grantor was paid
    pub settled_at: Option<DateTime<Utc>>,
    /// Set when the grant was revoked with this collection unsettled
    pub needs_reconciliation: bool,

    /// Collection time
    pub collected_at: DateTime<Utc>,
    /// Optimistic concurrency version
    pub version: u64,
}

impl AtcCollection {
    /// Generate a collection reference
    pub fn new_reference(id: Uuid) -> String {
        short_reference("COL", id)
    }

    /// Earliest time the collection may be batched
    pub fn due_at(&self, delay_days: u32) -> DateTime<Utc> {
        self.collected_at + Duration::days(i64::from(delay_days))
    }

    /// Pending, unbatched, and past its settlement delay
    pub fn is_eligible_for_batching(&self, delay_days: u32, now: DateTime<Utc>) -> bool {
        self.settlement_status == SettlementStatus::Pending
            && self.settlement_batch_id.is_none()
            && now >= self.due_at(delay_days)
    }

    /// Move to a new settlement status, enforcing the transition table
    pub fn transition(&mut self, next: SettlementStatus) -> Result<()> {
        if !self.settlement_status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "collection {} cannot move from {} to {}",
                self.reference, self.settlement_status, next
            )));
        }
        self.settlement_status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(collected_at: DateTime<Utc>) -> AtcCollection {
        let id = Uuid::now_v7();
        AtcCollection {
            id,
            reference: AtcCollection::new_reference(id),
            grant_id: Uuid::now_v7(),
            grantor_id: PartyId::random(),
            grantee_id: PartyId::random(),
            collected_from: Payer {
                id: PartyId::random(),
                party_type: PartyType::Retailer,
                name: "Duka".into(),
            },
            method: CollectionMethod::Cash,
            payment_reference: None,
            order_ref: OrderRef::default(),
            collected_by: None,
            notes: None,
            gross_amount: Decimal::from(100),
            commission_amount: Decimal::from(5),
            net_amount: Decimal::from(95),
            settlement_status: SettlementStatus::Pending,
            settlement_batch_id: None,
            settled_at: None,
            needs_reconciliation: false,
            collected_at,
            version: 0,
        }
    }

    #[test]
    fn test_batching_eligibility_respects_delay() {
        let now = Utc::now();
        let c = collection(now - Duration::days(1));
        assert!(c.is_eligible_for_batching(1, now));
        assert!(!c.is_eligible_for_batching(2, now));
    }

    #[test]
    fn test_claimed_collection_not_eligible() {
        let now = Utc::now();
        let mut c = collection(now);
        c.transition(SettlementStatus::Scheduled).unwrap();
        c.settlement_batch_id = Some(Uuid::now_v7());
        assert!(!c.is_eligible_for_batching(0, now));
    }

    #[test]
    fn test_settled_is_final() {
        let mut c = collection(Utc::now());
        c.transition(SettlementStatus::Scheduled).unwrap();
        c.transition(SettlementStatus::Processing).unwrap();
        c.transition(SettlementStatus::Settled).unwrap();
        assert!(c.transition(SettlementStatus::Pending).is_err());
    }
}
