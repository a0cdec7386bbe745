//! Reconciliation engine
//!
//! Periodic checks that the books close:
//!
//! - settled batch net vs the amount the rail says it moved
//! - batch totals vs the sum of member collections
//! - grant cumulative total vs the sum of its collections' gross
//!
//! Mismatches are recorded as discrepancies and never corrected
//! automatically. A check that already has an open discrepancy for the same
//! subject is not raised again.

use crate::rail::PaymentRail;
use crate::Result;
use atc_core::error::retry_on_conflict;
use atc_core::types::{
    BatchStatus, DiscrepancyKind, DiscrepancyStatus, ReconciliationDiscrepancy,
    ReconciliationStatus, SettlementStatus,
};
use atc_core::{AtcEvent, AtcStore, EventBus, Metrics};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    /// Settled batches compared against the rail
    pub batches_checked: usize,
    /// Grants whose cumulative total was checked
    pub grants_checked: usize,
    /// Discrepancies raised by this run
    pub discrepancies: Vec<ReconciliationDiscrepancy>,
    /// Settled collections whose reconciliation flag was cleared
    pub flags_cleared: usize,
}

/// Reconciliation engine
pub struct Reconciler {
    store: Arc<dyn AtcStore>,
    rail: Arc<dyn PaymentRail>,
    events: EventBus,
    metrics: Metrics,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        store: Arc<dyn AtcStore>,
        rail: Arc<dyn PaymentRail>,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            rail,
            events,
            metrics,
        }
    }

    /// Run every check once
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        let mut open: HashSet<(DiscrepancyKind, Uuid)> = self
            .store
            .list_discrepancies()?
            .into_iter()
            .filter(|d| d.status == DiscrepancyStatus::Open)
            .map(|d| (d.kind, d.subject_id))
            .collect();
        let mut report = ReconciliationReport::default();

        self.check_settled_batches(now, &mut open, &mut report)
            .await?;
        self.check_batch_totals(now, &mut open, &mut report)?;
        self.check_grants(now, &mut open, &mut report)?;

        info!(
            batches = report.batches_checked,
            grants = report.grants_checked,
            discrepancies = report.discrepancies.len(),
            flags_cleared = report.flags_cleared,
            "Reconciliation run complete"
        );
        Ok(report)
    }

    /// Discrepancies, optionally only the open ones
    pub fn discrepancies(&self, open_only: bool) -> Result<Vec<ReconciliationDiscrepancy>> {
        Ok(self
            .store
            .list_discrepancies()?
            .into_iter()
            .filter(|d| !open_only || d.status == DiscrepancyStatus::Open)
            .collect())
    }

    /// Close a discrepancy after operator review
    pub fn resolve_discrepancy(
        &self,
        id: Uuid,
        notes: Option<String>,
    ) -> Result<ReconciliationDiscrepancy> {
        let mut discrepancy = self
            .store
            .list_discrepancies()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| atc_core::Error::Validation(format!("discrepancy {} not found", id)))?;
        discrepancy.status = DiscrepancyStatus::Resolved;
        if notes.is_some() {
            discrepancy.notes = notes;
        }
        self.store.update_discrepancy(&discrepancy)?;
        info!(discrepancy_id = %id, kind = %discrepancy.kind, "Discrepancy resolved");
        Ok(discrepancy)
    }

    async fn check_settled_batches(
        &self,
        now: DateTime<Utc>,
        open: &mut HashSet<(DiscrepancyKind, Uuid)>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let pending = self
            .store
            .batches_in_status(BatchStatus::Settled)?
            .into_iter()
            .filter(|b| b.reconciliation_status == ReconciliationStatus::Unreconciled);

        for batch in pending {
            let Some(reference) = batch.rail_reference.as_deref() else {
                debug!(batch = %batch.reference, "Settled without rail reference, skipping");
                continue;
            };
            let record = match self.rail.lookup_payment(reference).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(batch = %batch.reference, error = %e, "Rail lookup failed");
                    continue;
                }
            };
            report.batches_checked += 1;

            let status = if record.amount == batch.total_net {
                ReconciliationStatus::Matched
            } else {
                self.raise(
                    open,
                    report,
                    ReconciliationDiscrepancy::open(
                        DiscrepancyKind::SettledAmountMismatch,
                        batch.id,
                        batch.total_net,
                        record.amount,
                        now,
                        Some(format!("rail reference {}", reference)),
                    ),
                )?;
                ReconciliationStatus::Discrepancy
            };

            retry_on_conflict(|| {
                let mut current = self.store.require_batch(batch.id)?;
                current.reconciliation_status = status;
                self.store.update_batch(&current, &[])
            })?;
        }
        Ok(())
    }

    fn check_batch_totals(
        &self,
        now: DateTime<Utc>,
        open: &mut HashSet<(DiscrepancyKind, Uuid)>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        for batch in self.store.list_batches()? {
            if batch.status == BatchStatus::Cancelled {
                continue;
            }
            let mut members_net = Decimal::ZERO;
            for id in &batch.collection_ids {
                if let Some(c) = self.store.get_collection(*id)? {
                    members_net += c.net_amount;
                }
            }
            if members_net != batch.total_net {
                self.raise(
                    open,
                    report,
                    ReconciliationDiscrepancy::open(
                        DiscrepancyKind::BatchTotalMismatch,
                        batch.id,
                        members_net,
                        batch.total_net,
                        now,
                        None,
                    ),
                )?;
            }
        }
        Ok(())
    }

    fn check_grants(
        &self,
        now: DateTime<Utc>,
        open: &mut HashSet<(DiscrepancyKind, Uuid)>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        for grant in self.store.list_grants()? {
            report.grants_checked += 1;
            let collections = self.store.collections_for_grant(grant.id)?;

            let gross: Decimal = collections.iter().map(|c| c.gross_amount).sum();
            if gross != grant.cumulative_collected {
                self.raise(
                    open,
                    report,
                    ReconciliationDiscrepancy::open(
                        DiscrepancyKind::CumulativeMismatch,
                        grant.id,
                        gross,
                        grant.cumulative_collected,
                        now,
                        Some(format!("grant {}", grant.reference)),
                    ),
                )?;
            }

            for c in collections {
                if !(c.needs_reconciliation && c.settlement_status == SettlementStatus::Settled) {
                    continue;
                }
                retry_on_conflict(|| {
                    let mut current = self.store.require_collection(c.id)?;
                    current.needs_reconciliation = false;
                    self.store.update_collection(&current)
                })?;
                report.flags_cleared += 1;
            }
        }
        Ok(())
    }

    fn raise(
        &self,
        open: &mut HashSet<(DiscrepancyKind, Uuid)>,
        report: &mut ReconciliationReport,
        discrepancy: ReconciliationDiscrepancy,
    ) -> Result<()> {
        if !open.insert((discrepancy.kind, discrepancy.subject_id)) {
            return Ok(());
        }
        self.store.insert_discrepancy(&discrepancy)?;

        warn!(
            kind = %discrepancy.kind,
            subject_id = %discrepancy.subject_id,
            expected = %discrepancy.expected,
            actual = %discrepancy.actual,
            "Reconciliation discrepancy"
        );
        self.metrics.record_discrepancy(&discrepancy.kind.to_string());
        self.events.emit(AtcEvent::DiscrepancyRaised {
            discrepancy_id: discrepancy.id,
            kind: discrepancy.kind,
            subject_id: discrepancy.subject_id,
            difference: discrepancy.difference,
        });
        report.discrepancies.push(discrepancy);
        Ok(())
    }
}
