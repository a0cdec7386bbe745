//! Settlement batches and reconciliation discrepancies

use super::{short_reference, AtcCollection, Currency, PartyId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Saga state of a settlement batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BatchStatus {
    /// Collections claimed, payment not started
    Batched = 1,
    /// Payment handed to the rail
    PaymentInitiated = 2,
    /// Rail reported failure or timed out
    PaymentFailed = 3,
    /// Grantor paid (terminal)
    Settled = 4,
    /// Abandoned before initiation (terminal)
    Cancelled = 5,
    /// Retries exhausted; waiting on an operator
    ManualReview = 6,
}

impl BatchStatus {
    /// Terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Settled | BatchStatus::Cancelled)
    }

    /// Transition table
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Batched, PaymentInitiated)
                | (Batched, Cancelled)
                | (PaymentInitiated, Settled)
                | (PaymentInitiated, PaymentFailed)
                | (PaymentFailed, Batched)
                | (PaymentFailed, Cancelled)
                | (PaymentFailed, ManualReview)
                | (ManualReview, Settled)
                | (ManualReview, Cancelled)
        )
    }

    /// Whether an operator may still cancel the batch
    pub fn is_cancellable(&self) -> bool {
        matches!(self, BatchStatus::Batched | BatchStatus::PaymentFailed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Batched => "BATCHED",
            BatchStatus::PaymentInitiated => "PAYMENT_INITIATED",
            BatchStatus::PaymentFailed => "PAYMENT_FAILED",
            BatchStatus::Settled => "SETTLED",
            BatchStatus::Cancelled => "CANCELLED",
            BatchStatus::ManualReview => "MANUAL_REVIEW",
        };
        f.write_str(s)
    }
}

/// Payment status as reported by the rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Not yet sent
    Pending,
    /// Accepted by the rail, not final
    Processing,
    /// Funds delivered
    Settled,
    /// Rail rejected or lost the payment
    Failed,
    /// Only part of the amount moved
    Partial,
}

impl PaymentStatus {
    /// Final outcome reached
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Settled | PaymentStatus::Failed | PaymentStatus::Partial
        )
    }
}

/// Result of reconciling a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    /// Not checked yet
    Unreconciled,
    /// Amounts agree
    Matched,
    /// A discrepancy was raised
    Discrepancy,
}

/// A payment from one grant's collections to its grantor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBatch {
    /// Batch ID
    pub id: Uuid,
    /// Human-readable reference
    pub reference: String,
    /// Grant whose collections are settled
    pub grant_id: Uuid,
    /// Party being paid
    pub grantor_id: PartyId,
    /// Rail destination
    pub destination: String,
    /// Currency
    pub currency: Currency,

    /// Start of the settlement period
    pub period_start: DateTime<Utc>,
    /// End of the settlement period
    pub period_end: DateTime<Utc>,

    /// Member collections
    pub collection_ids: Vec<Uuid>,
    /// Sum of member gross amounts
    pub total_gross: Decimal,
    /// Sum of member commissions
    pub total_commission: Decimal,
    /// Sum of member nets; the amount paid
    pub total_net: Decimal,
    /// Number of member collections
    pub transaction_count: u32,

    /// Saga state
    pub status: BatchStatus,
    /// Mirror of the rail's view
    pub payment_status: PaymentStatus,
    /// Reconciliation outcome
    pub reconciliation_status: ReconciliationStatus,

    /// Stable across retries so the rail can dedupe
    pub idempotency_key: String,
    /// Initiation attempts so far
    pub attempts: u32,
    /// Earliest time of the next retry
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Reference assigned by the rail
    pub rail_reference: Option<String>,
    /// Last failure reason
    pub failure_reason: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last initiation time
    pub initiated_at: Option<DateTime<Utc>>,
    /// Settlement time
    pub settled_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version
    pub version: u64,
}

impl SettlementBatch {
    /// Idempotency key for a batch, fixed for its whole life
    pub fn idempotency_key_for(batch_id: Uuid) -> String {
        format!("atc-settle-{}", batch_id)
    }

    /// Generate a batch reference
    pub fn new_reference(id: Uuid) -> String {
        short_reference("STL", id)
    }

    /// Move to a new saga state, enforcing the transition table
    pub fn transition(&mut self, next: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "batch {} cannot move from {} to {}",
                self.reference, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Set member ids and totals from the collections actually claimed.
    /// Totals are plain sums of per-collection values.
    pub fn apply_members(&mut self, members: &[AtcCollection]) {
        self.collection_ids = members.iter().map(|c| c.id).collect();
        self.total_gross = members.iter().map(|c| c.gross_amount).sum();
        self.total_commission = members.iter().map(|c| c.commission_amount).sum();
        self.total_net = members.iter().map(|c| c.net_amount).sum();
        self.transaction_count = members.len() as u32;
    }

    /// Whether a retry is due
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == BatchStatus::Batched
            && self.attempts > 0
            && self.next_retry_at.map_or(true, |at| now >= at)
    }
}

/// Kind of reconciliation mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscrepancyKind {
    /// Rail-recorded amount differs from the batch net
    SettledAmountMismatch,
    /// Grant cumulative differs from the sum of its collections
    CumulativeMismatch,
    /// Batch totals differ from the sum of member collections
    BatchTotalMismatch,
    /// Payment retries exhausted
    PaymentEscalated,
    /// Rail settled a payment for a batch already cancelled
    CancelledBatchPaid,
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscrepancyKind::SettledAmountMismatch => "SETTLED_AMOUNT_MISMATCH",
            DiscrepancyKind::CumulativeMismatch => "CUMULATIVE_MISMATCH",
            DiscrepancyKind::BatchTotalMismatch => "BATCH_TOTAL_MISMATCH",
            DiscrepancyKind::PaymentEscalated => "PAYMENT_ESCALATED",
            DiscrepancyKind::CancelledBatchPaid => "CANCELLED_BATCH_PAID",
        };
        f.write_str(s)
    }
}

/// Discrepancy lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscrepancyStatus {
    /// Needs attention
    Open,
    /// Closed by an operator
    Resolved,
}

/// A recorded mismatch. Never auto-corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationDiscrepancy {
    /// Discrepancy ID
    pub id: Uuid,
    /// What disagreed
    pub kind: DiscrepancyKind,
    /// Batch or grant the check ran against
    pub subject_id: Uuid,
    /// Value the engine expected
    pub expected: Decimal,
    /// Value observed
    pub actual: Decimal,
    /// actual - expected
    pub difference: Decimal,
    /// Lifecycle
    pub status: DiscrepancyStatus,
    /// Detection time
    pub detected_at: DateTime<Utc>,
    /// Operator or engine notes
    pub notes: Option<String>,
}

impl ReconciliationDiscrepancy {
    /// New open discrepancy
    pub fn open(
        kind: DiscrepancyKind,
        subject_id: Uuid,
        expected: Decimal,
        actual: Decimal,
        detected_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            subject_id,
            expected,
            actual,
            difference: actual - expected,
            status: DiscrepancyStatus::Open,
            detected_at,
            notes,
        }
    }
}
