//! Settlement orchestrator
//!
//! Drives each batch through its saga:
//!
//! ```text
//! Batched ──initiate──▶ PaymentInitiated ──settled──▶ Settled
//!   │  ▲                      │
//!   │  └──── retry ─── PaymentFailed ◀──failed/timeout
//!   │                         │
//!   ▼                         ▼ (retries exhausted, partial payment)
//! Cancelled ◀──release── ManualReview ──confirm──▶ Settled
//! ```
//!
//! Saga state is persisted on the batch. The rail is called with no store
//! lock held and always with the batch's idempotency key; its answer is then
//! applied with an optimistic write that is retried once on conflict.

use crate::rail::{PaymentInstruction, PaymentRail, RailReceipt};
use crate::retry::{RetryDecision, RetryStrategy};
use crate::{Error, Result};
use atc_core::error::retry_on_conflict;
use atc_core::ledger::InstantSettlement;
use atc_core::types::{
    AtcCollection, BatchStatus, DiscrepancyKind, DiscrepancyStatus, PaymentStatus,
    ReconciliationDiscrepancy, ReconciliationStatus, SettlementBatch, SettlementStatus,
};
use atc_core::{AtcEvent, AtcStore, EventBus, Metrics};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Operator decision for a batch in manual review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManualResolution {
    /// Payment did not happen: cancel and return collections to pending
    Release,
    /// Payment happened: mark batch and collections settled
    ConfirmSettled,
}

enum Failure {
    Retry(DateTime<Utc>),
    Escalated,
}

/// Settlement orchestrator
pub struct SettlementOrchestrator {
    store: Arc<dyn AtcStore>,
    rail: Arc<dyn PaymentRail>,
    retry: RetryStrategy,
    payment_timeout: std::time::Duration,
    events: EventBus,
    metrics: Metrics,
}

impl SettlementOrchestrator {
    /// Create an orchestrator
    pub fn new(
        store: Arc<dyn AtcStore>,
        rail: Arc<dyn PaymentRail>,
        retry: RetryStrategy,
        payment_timeout: std::time::Duration,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            rail,
            retry,
            payment_timeout,
            events,
            metrics,
        }
    }

    /// Batch every eligible collection of a grant.
    ///
    /// Eligible means pending, unbatched and past the grant's delay. Returns
    /// `None` if nothing could be claimed.
    pub fn create_batch(
        &self,
        grant_id: Uuid,
        period: Option<(DateTime<Utc>, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementBatch>> {
        let grant = self.store.require_grant(grant_id)?;
        let destination = grant.settlement.account.destination().ok_or_else(|| {
            atc_core::Error::Validation(format!(
                "grant {} has no settlement destination",
                grant.reference
            ))
        })?;

        let eligible: Vec<AtcCollection> = self
            .store
            .collections_for_grant(grant_id)?
            .into_iter()
            .filter(|c| c.is_eligible_for_batching(grant.settlement.delay_days, now))
            .collect();
        let Some(first) = eligible.first() else {
            debug!(grant_id = %grant_id, "Nothing eligible for settlement");
            return Ok(None);
        };
        let (period_start, period_end) = period.unwrap_or((first.collected_at, now));

        let id = Uuid::now_v7();
        let mut batch = SettlementBatch {
            id,
            reference: SettlementBatch::new_reference(id),
            grant_id,
            grantor_id: grant.grantor_id,
            destination,
            currency: grant.currency,
            period_start,
            period_end,
            collection_ids: Vec::new(),
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
        };
        batch.apply_members(&eligible);

        let Some(batch) = self.store.claim_into_batch(&batch)? else {
            debug!(grant_id = %grant_id, "Collections claimed concurrently");
            return Ok(None);
        };

        info!(
            batch = %batch.reference,
            grant = %grant.reference,
            collections = batch.transaction_count,
            total_net = %batch.total_net,
            "Settlement batch created"
        );
        self.metrics.record_batch(&batch.status.to_string());
        self.events.emit(AtcEvent::BatchCreated {
            batch_id: batch.id,
            grant_id,
            total_net: batch.total_net,
            transaction_count: batch.transaction_count,
        });
        self.events.emit(AtcEvent::BatchUpdated {
            batch: Box::new(batch.clone()),
        });
        Ok(Some(batch))
    }

    /// Batch a grant's eligible collections and pay them right away
    pub async fn settle_now(
        &self,
        grant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementBatch>> {
        match self.create_batch(grant_id, None, now)? {
            Some(batch) => Ok(Some(self.initiate_payment(batch.id, now).await?)),
            None => Ok(None),
        }
    }

    /// Hand a batch to the rail.
    ///
    /// A batch already initiated or settled is returned unchanged.
    pub async fn initiate_payment(
        &self,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let batch = self.store.require_batch(batch_id)?;
        match batch.status {
            BatchStatus::Batched => {}
            BatchStatus::PaymentInitiated | BatchStatus::Settled => return Ok(batch),
            other => {
                return Err(atc_core::Error::InvalidTransition(format!(
                    "batch {} is {}, cannot initiate payment",
                    batch.reference, other
                ))
                .into())
            }
        }

        let instruction = PaymentInstruction {
            idempotency_key: batch.idempotency_key.clone(),
            destination: batch.destination.clone(),
            amount: batch.total_net,
            currency: batch.currency,
        };
        self.metrics.record_payment_attempt();
        info!(
            batch = %batch.reference,
            attempt = batch.attempts + 1,
            amount = %instruction.amount,
            "Initiating settlement payment"
        );

        let outcome =
            match tokio::time::timeout(self.payment_timeout, self.rail.initiate_payment(&instruction))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::RailTimeout(self.payment_timeout.as_secs())),
            };

        match outcome {
            Ok(receipt) => self.record_initiated(batch_id, receipt, now),
            Err(e) => {
                warn!(batch = %batch.reference, error = %e, "Payment initiation failed");
                self.record_failed_initiation(batch_id, &e.to_string(), now)
            }
        }
    }

    /// Apply a rail status callback
    pub fn on_payment_callback(
        &self,
        rail_reference: &str,
        status: PaymentStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let batch = self
            .store
            .find_batch_by_rail_reference(rail_reference)?
            .ok_or_else(|| atc_core::Error::BatchNotFound(rail_reference.to_string()))?;
        info!(
            batch = %batch.reference,
            rail_reference = %rail_reference,
            status = ?status,
            "Payment callback"
        );
        self.apply_rail_status(batch.id, status, reason, now)
    }

    /// Fail or resolve initiated payments the rail has not confirmed in time
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let timeout =
            Duration::from_std(self.payment_timeout).unwrap_or_else(|_| Duration::weeks(52));
        let overdue: Vec<SettlementBatch> = self
            .store
            .batches_in_status(BatchStatus::PaymentInitiated)?
            .into_iter()
            .filter(|b| {
                b.initiated_at
                    .and_then(|at| at.checked_add_signed(timeout))
                    .map_or(true, |deadline| now >= deadline)
            })
            .collect();

        let mut handled = Vec::with_capacity(overdue.len());
        for batch in overdue {
            let looked_up = match &batch.rail_reference {
                Some(reference) => self.rail.lookup_payment(reference).await.ok(),
                None => None,
            };
            let result = match looked_up {
                Some(record) if record.status.is_final() => {
                    self.apply_rail_status(batch.id, record.status, None, now)
                }
                _ => self.fail(
                    batch.id,
                    &format!("no confirmation within {}s", self.payment_timeout.as_secs()),
                    PaymentStatus::Failed,
                    now,
                ),
            };
            match result {
                Ok(_) => handled.push(batch.id),
                Err(e) => warn!(batch = %batch.reference, error = %e, "Timeout handling failed"),
            }
        }
        Ok(handled)
    }

    /// Re-initiate failed batches whose backoff has elapsed
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<Vec<SettlementBatch>> {
        let due: Vec<SettlementBatch> = self
            .store
            .batches_in_status(BatchStatus::Batched)?
            .into_iter()
            .filter(|b| b.retry_due(now))
            .collect();
        self.initiate_all(due, now).await
    }

    /// Initiate batches that were created but never handed to the rail
    pub async fn initiate_new(&self, now: DateTime<Utc>) -> Result<Vec<SettlementBatch>> {
        let fresh: Vec<SettlementBatch> = self
            .store
            .batches_in_status(BatchStatus::Batched)?
            .into_iter()
            .filter(|b| b.attempts == 0)
            .collect();
        self.initiate_all(fresh, now).await
    }

    /// Cancel a batch that is not awaiting the rail, returning its
    /// collections to pending.
    ///
    /// A batch that was already attempted is only cancelled once the rail
    /// reports that attempt failed; a payment the rail may still complete
    /// keeps its collections.
    pub async fn cancel_batch(
        &self,
        batch_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let current = self.store.require_batch(batch_id)?;
        let attempted = current.status.is_cancellable() && current.attempts > 0;
        if let Some(reference) = current.rail_reference.as_deref().filter(|_| attempted) {
            let record = self.rail.lookup_payment(reference).await?;
            match record.status {
                PaymentStatus::Failed => {}
                PaymentStatus::Settled | PaymentStatus::Partial => {
                    self.apply_rail_status(batch_id, record.status, None, now)?;
                    return Err(atc_core::Error::InvalidTransition(format!(
                        "batch {} was paid by the rail ({}), cannot cancel",
                        current.reference, reference
                    ))
                    .into());
                }
                other => {
                    return Err(atc_core::Error::InvalidTransition(format!(
                        "batch {} has payment {} still {:?} on the rail, cannot cancel",
                        current.reference, reference, other
                    ))
                    .into());
                }
            }
        }

        let (batch, _) = self.apply(batch_id, |batch, members| {
            if !batch.status.is_cancellable() {
                return Err(atc_core::Error::InvalidTransition(format!(
                    "batch {} is {}, only batched or failed batches can be cancelled",
                    batch.reference, batch.status
                )));
            }
            batch.transition(BatchStatus::Cancelled)?;
            batch.failure_reason = Some(reason.to_string());
            batch.next_retry_at = None;
            for c in members.iter_mut() {
                release(c)?;
            }
            Ok(true)
        })?;

        info!(batch = %batch.reference, reason = %reason, at = %now, "Settlement batch cancelled");
        self.metrics.record_batch(&batch.status.to_string());
        self.events.emit(AtcEvent::BatchCancelled {
            batch_id,
            reason: reason.to_string(),
        });
        Ok(batch)
    }

    /// Cancel every cancellable batch of a grant. Batches whose payment the
    /// rail may still complete are left to finish.
    pub async fn cancel_open_batches_for_grant(
        &self,
        grant_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut cancelled = Vec::new();
        for batch in self.store.batches_for_grant(grant_id)? {
            if batch.status.is_cancellable() {
                match self.cancel_batch(batch.id, reason, now).await {
                    Ok(_) => cancelled.push(batch.id),
                    Err(e) => warn!(batch = %batch.reference, error = %e, "Batch left open"),
                }
            }
        }
        Ok(cancelled)
    }

    /// Close a batch that is in manual review
    pub fn resolve_manual_review(
        &self,
        batch_id: Uuid,
        resolution: ManualResolution,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let (batch, _) = self.apply(batch_id, |batch, members| {
            if batch.status != BatchStatus::ManualReview {
                return Err(atc_core::Error::InvalidTransition(format!(
                    "batch {} is {}, not in manual review",
                    batch.reference, batch.status
                )));
            }
            match resolution {
                ManualResolution::Release => {
                    batch.transition(BatchStatus::Cancelled)?;
                    for c in members.iter_mut() {
                        release(c)?;
                    }
                }
                ManualResolution::ConfirmSettled => {
                    mark_settled(batch, members, now)?;
                }
            }
            Ok(true)
        })?;

        for mut d in self.store.list_discrepancies()? {
            if d.kind == DiscrepancyKind::PaymentEscalated
                && d.subject_id == batch_id
                && d.status == DiscrepancyStatus::Open
            {
                d.status = DiscrepancyStatus::Resolved;
                d.notes = note.clone().or(Some(format!("{:?}", resolution)));
                self.store.update_discrepancy(&d)?;
            }
        }

        info!(batch = %batch.reference, resolution = ?resolution, "Manual review resolved");
        self.metrics.record_batch(&batch.status.to_string());
        match resolution {
            ManualResolution::Release => self.events.emit(AtcEvent::BatchCancelled {
                batch_id,
                reason: note.unwrap_or_else(|| "released after manual review".to_string()),
            }),
            ManualResolution::ConfirmSettled => self.emit_settled(&batch),
        }
        Ok(batch)
    }

    /// Consume instant-settlement requests until the queue closes
    pub async fn run_instant_worker(self: Arc<Self>, mut rx: mpsc::Receiver<InstantSettlement>) {
        info!("Instant settlement worker started");
        while let Some(job) = rx.recv().await {
            match self.settle_now(job.grant_id, Utc::now()).await {
                Ok(Some(batch)) => debug!(
                    batch = %batch.reference,
                    collection_id = %job.collection_id,
                    "Instant settlement initiated"
                ),
                Ok(None) => debug!(
                    collection_id = %job.collection_id,
                    "Instant collection already batched"
                ),
                Err(e) => warn!(
                    grant_id = %job.grant_id,
                    error = %e,
                    "Instant settlement failed; scheduler will pick it up"
                ),
            }
        }
        info!("Instant settlement worker stopped");
    }

    // Internals

    async fn initiate_all(
        &self,
        batches: Vec<SettlementBatch>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SettlementBatch>> {
        let mut out = Vec::with_capacity(batches.len());
        for batch in batches {
            match self.initiate_payment(batch.id, now).await {
                Ok(b) => out.push(b),
                Err(e) => warn!(batch = %batch.reference, error = %e, "Initiation failed"),
            }
        }
        Ok(out)
    }

    fn members(&self, batch: &SettlementBatch) -> atc_core::Result<Vec<AtcCollection>> {
        let mut members = Vec::with_capacity(batch.collection_ids.len());
        for id in &batch.collection_ids {
            let c = self.store.require_collection(*id)?;
            if c.settlement_batch_id == Some(batch.id) {
                members.push(c);
            }
        }
        Ok(members)
    }

    /// Re-read the batch and its members, let `step` mutate them, write both
    /// back. `step` returns false to skip the write.
    fn apply(
        &self,
        batch_id: Uuid,
        mut step: impl FnMut(&mut SettlementBatch, &mut [AtcCollection]) -> atc_core::Result<bool>,
    ) -> Result<(SettlementBatch, bool)> {
        let out = retry_on_conflict(|| {
            let mut batch = self.store.require_batch(batch_id)?;
            let mut members = self.members(&batch)?;
            if !step(&mut batch, &mut members)? {
                return Ok((batch, false));
            }
            let stored = self.store.update_batch(&batch, &members)?;
            Ok((stored, true))
        })?;
        if out.1 {
            self.events.emit(AtcEvent::BatchUpdated {
                batch: Box::new(out.0.clone()),
            });
        }
        Ok(out)
    }

    fn record_initiated(
        &self,
        batch_id: Uuid,
        receipt: RailReceipt,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let (batch, changed) = self.apply(batch_id, |batch, members| {
            if batch.status != BatchStatus::Batched {
                // Another caller recorded this initiation first
                return Ok(false);
            }
            batch.transition(BatchStatus::PaymentInitiated)?;
            batch.attempts += 1;
            batch.initiated_at = Some(now);
            batch.rail_reference = Some(receipt.rail_reference.clone());
            batch.payment_status = PaymentStatus::Processing;
            batch.next_retry_at = None;
            for c in members.iter_mut() {
                if c.settlement_status == SettlementStatus::Scheduled {
                    c.transition(SettlementStatus::Processing)?;
                }
            }
            Ok(true)
        })?;

        if changed {
            info!(
                batch = %batch.reference,
                rail_reference = %receipt.rail_reference,
                attempt = batch.attempts,
                "Payment initiated"
            );
            self.metrics.record_batch(&batch.status.to_string());
            self.events.emit(AtcEvent::PaymentInitiated {
                batch_id,
                rail_reference: receipt.rail_reference.clone(),
                attempt: batch.attempts,
            });
        }

        if receipt.status.is_final() && batch.status == BatchStatus::PaymentInitiated {
            return self.apply_rail_status(batch_id, receipt.status, None, now);
        }
        Ok(batch)
    }

    fn record_failed_initiation(
        &self,
        batch_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let mut failure = None;
        let (batch, changed) = self.apply(batch_id, |batch, members| {
            if batch.status != BatchStatus::Batched {
                return Ok(false);
            }
            // The attempt was made; it failed before the rail accepted it
            batch.transition(BatchStatus::PaymentInitiated)?;
            batch.attempts += 1;
            batch.initiated_at = Some(now);
            failure = Some(self.fail_step(batch, members, reason, PaymentStatus::Failed, now)?);
            Ok(true)
        })?;

        match failure {
            Some(failure) if changed => self.after_failure(batch, failure, reason, now),
            _ => Ok(batch),
        }
    }

    fn apply_rail_status(
        &self,
        batch_id: Uuid,
        status: PaymentStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        match status {
            PaymentStatus::Settled => self.complete(batch_id, now),
            PaymentStatus::Failed => self.fail(
                batch_id,
                reason.as_deref().unwrap_or("payment failed"),
                PaymentStatus::Failed,
                now,
            ),
            PaymentStatus::Partial => self.fail(
                batch_id,
                reason.as_deref().unwrap_or("partial payment"),
                PaymentStatus::Partial,
                now,
            ),
            PaymentStatus::Pending | PaymentStatus::Processing => {
                let (batch, _) = self.apply(batch_id, |batch, _| {
                    if batch.status != BatchStatus::PaymentInitiated || batch.payment_status == status
                    {
                        return Ok(false);
                    }
                    batch.payment_status = status;
                    Ok(true)
                })?;
                Ok(batch)
            }
        }
    }

    fn complete(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<SettlementBatch> {
        let current = self.store.require_batch(batch_id)?;
        if current.status == BatchStatus::Cancelled {
            self.flag_cancelled_batch_paid(&current, now)?;
            return Ok(current);
        }

        let (batch, changed) = self.apply(batch_id, |batch, members| {
            match batch.status {
                BatchStatus::Settled => return Ok(false),
                BatchStatus::Batched => {
                    // Confirmation of an attempt we had already given up on
                    warn!(batch = %batch.reference, "Late settlement confirmation");
                    batch.transition(BatchStatus::PaymentInitiated)?;
                    for c in members.iter_mut() {
                        if c.settlement_status == SettlementStatus::Scheduled {
                            c.transition(SettlementStatus::Processing)?;
                        }
                    }
                }
                _ => {}
            }
            mark_settled(batch, members, now)?;
            Ok(true)
        })?;

        if changed {
            self.metrics.record_batch(&batch.status.to_string());
            self.emit_settled(&batch);
        }
        Ok(batch)
    }

    fn fail(
        &self,
        batch_id: Uuid,
        reason: &str,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let mut failure = None;
        let (batch, changed) = self.apply(batch_id, |batch, members| {
            if batch.status != BatchStatus::PaymentInitiated {
                // Duplicate or late failure report
                return Ok(false);
            }
            failure = Some(self.fail_step(batch, members, reason, status, now)?);
            Ok(true)
        })?;

        match failure {
            Some(failure) if changed => self.after_failure(batch, failure, reason, now),
            _ => Ok(batch),
        }
    }

    /// PaymentInitiated → PaymentFailed → Batched (retry) or ManualReview
    fn fail_step(
        &self,
        batch: &mut SettlementBatch,
        members: &mut [AtcCollection],
        reason: &str,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> atc_core::Result<Failure> {
        batch.transition(BatchStatus::PaymentFailed)?;
        batch.payment_status = status;
        batch.failure_reason = Some(reason.to_string());

        let decision = if status == PaymentStatus::Partial {
            RetryDecision::Escalate
        } else {
            self.retry.decide(batch.attempts, now)
        };

        match decision {
            RetryDecision::RetryAt(at) => {
                batch.transition(BatchStatus::Batched)?;
                batch.next_retry_at = Some(at);
                for c in members.iter_mut() {
                    if c.settlement_status == SettlementStatus::Processing {
                        c.transition(SettlementStatus::Scheduled)?;
                    }
                }
                Ok(Failure::Retry(at))
            }
            RetryDecision::Escalate => {
                batch.transition(BatchStatus::ManualReview)?;
                batch.next_retry_at = None;
                for c in members.iter_mut() {
                    if matches!(
                        c.settlement_status,
                        SettlementStatus::Scheduled | SettlementStatus::Processing
                    ) {
                        c.transition(SettlementStatus::Disputed)?;
                    }
                }
                Ok(Failure::Escalated)
            }
        }
    }

    fn after_failure(
        &self,
        batch: SettlementBatch,
        failure: Failure,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let next_retry_at = match failure {
            Failure::Retry(at) => Some(at),
            Failure::Escalated => None,
        };
        warn!(
            batch = %batch.reference,
            attempt = batch.attempts,
            reason = %reason,
            next_retry_at = ?next_retry_at,
            "Settlement payment failed"
        );
        self.metrics
            .record_batch(&BatchStatus::PaymentFailed.to_string());
        self.events.emit(AtcEvent::PaymentFailed {
            batch_id: batch.id,
            reason: reason.to_string(),
            attempt: batch.attempts,
            next_retry_at,
        });

        if let Failure::Escalated = failure {
            let discrepancy = ReconciliationDiscrepancy::open(
                DiscrepancyKind::PaymentEscalated,
                batch.id,
                batch.total_net,
                Decimal::ZERO,
                now,
                Some(format!(
                    "{} after {} attempts",
                    reason, batch.attempts
                )),
            );
            self.store.insert_discrepancy(&discrepancy)?;

            warn!(
                batch = %batch.reference,
                collections = batch.collection_ids.len(),
                "Batch escalated to manual review"
            );
            self.metrics.record_batch(&batch.status.to_string());
            self.metrics
                .record_discrepancy(&discrepancy.kind.to_string());
            self.events.emit(AtcEvent::CollectionDisputed {
                batch_id: batch.id,
                collection_ids: batch.collection_ids.clone(),
            });
            self.events.emit(AtcEvent::DiscrepancyRaised {
                discrepancy_id: discrepancy.id,
                kind: discrepancy.kind,
                subject_id: batch.id,
                difference: discrepancy.difference,
            });
        }
        Ok(batch)
    }

    /// Money moved for a batch whose collections were already released.
    /// Recorded for an operator; the collections are not touched.
    fn flag_cancelled_batch_paid(&self, batch: &SettlementBatch, now: DateTime<Utc>) -> Result<()> {
        let already_open = self.store.list_discrepancies()?.iter().any(|d| {
            d.kind == DiscrepancyKind::CancelledBatchPaid
                && d.subject_id == batch.id
                && d.status == DiscrepancyStatus::Open
        });
        if already_open {
            return Ok(());
        }

        let discrepancy = ReconciliationDiscrepancy::open(
            DiscrepancyKind::CancelledBatchPaid,
            batch.id,
            Decimal::ZERO,
            batch.total_net,
            now,
            batch
                .rail_reference
                .as_ref()
                .map(|r| format!("rail reference {}", r)),
        );
        self.store.insert_discrepancy(&discrepancy)?;

        warn!(
            batch = %batch.reference,
            total_net = %batch.total_net,
            "Rail settled a cancelled batch"
        );
        self.metrics
            .record_discrepancy(&discrepancy.kind.to_string());
        self.events.emit(AtcEvent::DiscrepancyRaised {
            discrepancy_id: discrepancy.id,
            kind: discrepancy.kind,
            subject_id: batch.id,
            difference: discrepancy.difference,
        });
        Ok(())
    }

    fn emit_settled(&self, batch: &SettlementBatch) {
        info!(
            batch = %batch.reference,
            total_net = %batch.total_net,
            "Settlement completed"
        );
        self.events.emit(AtcEvent::SettlementCompleted {
            batch_id: batch.id,
            grant_id: batch.grant_id,
            total_net: batch.total_net,
            settled_at: batch.settled_at.unwrap_or(batch.created_at),
        });
    }
}

fn mark_settled(
    batch: &mut SettlementBatch,
    members: &mut [AtcCollection],
    now: DateTime<Utc>,
) -> atc_core::Result<()> {
    batch.transition(BatchStatus::Settled)?;
    batch.payment_status = PaymentStatus::Settled;
    batch.settled_at = Some(now);
    batch.next_retry_at = None;
    for c in members.iter_mut() {
        if matches!(
            c.settlement_status,
            SettlementStatus::Processing | SettlementStatus::Disputed
        ) {
            c.transition(SettlementStatus::Settled)?;
            c.settled_at = Some(now);
        }
    }
    Ok(())
}

/// Return a claimed collection to pending, outside any batch
fn release(c: &mut AtcCollection) -> atc_core::Result<()> {
    if c.settlement_status == SettlementStatus::Processing {
        c.transition(SettlementStatus::Scheduled)?;
    }
    c.transition(SettlementStatus::Pending)?;
    c.settlement_batch_id = None;
    Ok(())
}
