//! Collection ledger
//!
//! Records money collected under grants. A collection is accepted only if the
//! grant's limits hold at the moment its capacity is reserved, and the
//! reservation and the collection row are written in one atomic store step.
//!
//! # Example
//!
//! ```no_run
//! use atc_core::ledger::RecordCollectionRequest;
//! # fn demo(ledger: &atc_core::CollectionLedger, req: RecordCollectionRequest)
//! #     -> atc_core::Result<()> {
//! let collection = ledger.record_collection(req, chrono::Utc::now())?;
//! println!("{} net {}", collection.reference, collection.net_amount);
//! # Ok(())
//! # }
//! ```

use crate::commission::{CommissionCalculator, CommissionSplit};
use crate::events::{AtcEvent, EventBus};
use crate::limits::{self, LimitEnforcer};
use crate::metrics::Metrics;
use crate::registry::GrantRegistry;
use crate::storage::AtcStore;
use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// How the collection picks its grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GrantSelector {
    /// Explicit grant
    Id(Uuid),
    /// Most specific active grant between the two parties
    AutoResolve {
        /// Grantor
        grantor_id: PartyId,
        /// Grantee
        grantee_id: PartyId,
    },
}

/// Request to record a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCollectionRequest {
    /// Grant to collect under
    pub grant: GrantSelector,
    /// Who paid
    pub payer: Payer,
    /// Gross amount
    pub amount: Decimal,
    /// Rail used
    pub method: CollectionMethod,
    /// Linked order/invoice
    pub order_ref: OrderRef,
    /// Order attributes for scope checks
    pub context: OrderContext,
    /// External payment reference
    pub payment_reference: Option<String>,
    /// Worker who collected
    pub collected_by: Option<PartyId>,
    /// Notes
    pub notes: Option<String>,
}

/// Collection handed to the instant-settlement worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstantSettlement {
    /// Grant with instant frequency
    pub grant_id: Uuid,
    /// The new collection
    pub collection_id: Uuid,
}

/// Dry-run answer to "may this grantee collect this?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityCheck {
    /// Collection would be accepted
    pub authorized: bool,
    /// Grant that would be used
    pub grant_id: Option<Uuid>,
    /// Grant reference
    pub grant_reference: Option<String>,
    /// Why not
    pub reason: Option<String>,
    /// Commission the grantee would keep
    pub commission: Option<CommissionSplit>,
    /// Capacity left under the cumulative limit
    pub remaining_capacity: Option<Decimal>,
}

/// Commission earned by a grantee over a period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommissionSummary {
    /// Number of collections
    pub collection_count: u64,
    /// Sum of gross
    pub total_gross: Decimal,
    /// Sum of commission
    pub total_commission: Decimal,
    /// Sum of net
    pub total_net: Decimal,
    /// Commission by grant reference
    pub by_grant: BTreeMap<String, Decimal>,
}

/// Collections made for a grantor over a period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    /// Number of collections
    pub collection_count: u64,
    /// Sum of gross
    pub total_gross: Decimal,
    /// Sum of net
    pub total_net: Decimal,
    /// Net already paid to the grantor
    pub settled_net: Decimal,
    /// Net still owed
    pub outstanding_net: Decimal,
    /// Gross by method
    pub by_method: BTreeMap<String, Decimal>,
    /// Count by settlement status
    pub by_status: BTreeMap<String, u64>,
}

/// Collection ledger
pub struct CollectionLedger {
    store: Arc<dyn AtcStore>,
    registry: Arc<GrantRegistry>,
    enforcer: LimitEnforcer,
    calculator: CommissionCalculator,
    minor_units: u32,
    events: EventBus,
    metrics: Metrics,
    instant_tx: Option<mpsc::Sender<InstantSettlement>>,
}

impl CollectionLedger {
    /// Create a ledger
    pub fn new(
        store: Arc<dyn AtcStore>,
        registry: Arc<GrantRegistry>,
        currency: Currency,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            enforcer: LimitEnforcer::new(store.clone()),
            store,
            registry,
            calculator: CommissionCalculator::new(currency.minor_units()),
            minor_units: currency.minor_units(),
            events,
            metrics,
            instant_tx: None,
        }
    }

    /// Hand instant-frequency collections to this queue
    pub fn with_instant_queue(mut self, tx: mpsc::Sender<InstantSettlement>) -> Self {
        self.instant_tx = Some(tx);
        self
    }

    /// Record a collection
    pub fn record_collection(
        &self,
        req: RecordCollectionRequest,
        now: DateTime<Utc>,
    ) -> Result<AtcCollection> {
        self.validate_amount(req.amount)?;
        let grant = self.resolve_grant(&req.grant, &req.context, req.method, now)?;

        if !grant.scope.covers(&req.context) {
            self.metrics.record_rejection("scope");
            return Err(Error::CollectionNotAllowed(format!(
                "grant {} ({} scope) does not cover this order",
                grant.reference,
                grant.scope.kind()
            )));
        }
        if let Err(rejection) = limits::check(&grant, req.amount, req.method, now) {
            self.metrics.record_rejection(rejection.label());
            return Err(rejection.into_error(&grant.reference));
        }

        let split = self.calculator.calculate(&grant.commission, req.amount)?;

        let id = Uuid::now_v7();
        let collection = AtcCollection {
            id,
            reference: AtcCollection::new_reference(id),
            grant_id: grant.id,
            grantor_id: grant.grantor_id,
            grantee_id: grant.grantee_id,
            collected_from: req.payer,
            method: req.method,
            payment_reference: req.payment_reference,
            order_ref: req.order_ref,
            collected_by: req.collected_by,
            notes: req.notes,
            gross_amount: req.amount,
            commission_amount: split.commission,
            net_amount: split.net,
            settlement_status: SettlementStatus::Pending,
            settlement_batch_id: None,
            settled_at: None,
            needs_reconciliation: false,
            collected_at: now,
            version: 0,
        };

        let reservation =
            self.enforcer
                .reserve_with(grant.id, req.amount, req.method, now, Some(&collection))?;
        if let Some(rejection) = reservation.reason {
            self.metrics.record_rejection(rejection.label());
            return Err(rejection.into_error(&grant.reference));
        }

        self.metrics
            .record_collection(collection.gross_amount.to_f64().unwrap_or_default());
        info!(
            collection_id = %collection.id,
            reference = %collection.reference,
            grant = %grant.reference,
            gross = %collection.gross_amount,
            commission = %collection.commission_amount,
            cumulative = %reservation.cumulative,
            "Collection recorded"
        );
        self.events.emit(AtcEvent::CollectionRecorded {
            collection_id: collection.id,
            grant_id: grant.id,
            gross: collection.gross_amount,
            commission: collection.commission_amount,
            net: collection.net_amount,
        });

        if grant.settlement.frequency == SettlementFrequency::Instant {
            self.hand_off_instant(grant.id, collection.id);
        }

        Ok(collection)
    }

    /// Check whether a collection would be accepted, without writing anything
    pub fn verify_authority(
        &self,
        selector: &GrantSelector,
        amount: Decimal,
        method: CollectionMethod,
        context: &OrderContext,
        now: DateTime<Utc>,
    ) -> Result<AuthorityCheck> {
        let denied = |grant: Option<&AtcGrant>, reason: String| AuthorityCheck {
            authorized: false,
            grant_id: grant.map(|g| g.id),
            grant_reference: grant.map(|g| g.reference.clone()),
            reason: Some(reason),
            commission: None,
            remaining_capacity: grant.and_then(|g| g.remaining_capacity()),
        };

        if let Err(e) = self.validate_amount(amount) {
            return Ok(denied(None, e.to_string()));
        }
        let grant = match self.resolve_grant(selector, context, method, now) {
            Ok(g) => g,
            Err(e @ (Error::NoGrantFound(_) | Error::GrantNotFound(_))) => {
                return Ok(denied(None, e.to_string()))
            }
            Err(e) => return Err(e),
        };
        if !grant.scope.covers(context) {
            return Ok(denied(Some(&grant), "order outside grant scope".to_string()));
        }
        if let Err(rejection) = limits::check(&grant, amount, method, now) {
            return Ok(denied(Some(&grant), rejection.to_string()));
        }
        let split = match self.calculator.calculate(&grant.commission, amount) {
            Ok(split) => split,
            Err(e @ Error::NoMatchingTier(_)) => return Ok(denied(Some(&grant), e.to_string())),
            Err(e) => return Err(e),
        };

        Ok(AuthorityCheck {
            authorized: true,
            grant_id: Some(grant.id),
            grant_reference: Some(grant.reference.clone()),
            reason: None,
            commission: Some(split),
            remaining_capacity: grant.remaining_capacity(),
        })
    }

    /// Get a collection
    pub fn get_collection(&self, id: Uuid) -> Result<AtcCollection> {
        self.store.require_collection(id)
    }

    /// Collections of a grant with `collected_at` in `[from, to)`
    pub fn collections_by_grant(
        &self,
        grant_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AtcCollection>> {
        self.store.require_grant(grant_id)?;
        Ok(self
            .store
            .collections_for_grant(grant_id)?
            .into_iter()
            .filter(|c| in_range(c.collected_at, from, to))
            .collect())
    }

    /// Commission earned by a grantee in `[from, to)`
    pub fn commission_summary(
        &self,
        grantee_id: PartyId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<CommissionSummary> {
        let mut summary = CommissionSummary::default();
        for grant in self.registry.list_by_grantee(grantee_id)? {
            for c in self.store.collections_for_grant(grant.id)? {
                if !in_range(c.collected_at, from, to) {
                    continue;
                }
                summary.collection_count += 1;
                summary.total_gross += c.gross_amount;
                summary.total_commission += c.commission_amount;
                summary.total_net += c.net_amount;
                *summary
                    .by_grant
                    .entry(grant.reference.clone())
                    .or_default() += c.commission_amount;
            }
        }
        Ok(summary)
    }

    /// Collections made for a grantor in `[from, to)`
    pub fn collection_summary(
        &self,
        grantor_id: PartyId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<CollectionSummary> {
        let mut summary = CollectionSummary::default();
        for grant in self.registry.list_by_grantor(grantor_id)? {
            for c in self.store.collections_for_grant(grant.id)? {
                if !in_range(c.collected_at, from, to) {
                    continue;
                }
                summary.collection_count += 1;
                summary.total_gross += c.gross_amount;
                summary.total_net += c.net_amount;
                if c.settlement_status == SettlementStatus::Settled {
                    summary.settled_net += c.net_amount;
                } else {
                    summary.outstanding_net += c.net_amount;
                }
                *summary.by_method.entry(c.method.to_string()).or_default() += c.gross_amount;
                *summary
                    .by_status
                    .entry(c.settlement_status.to_string())
                    .or_default() += 1;
            }
        }
        Ok(summary)
    }

    fn resolve_grant(
        &self,
        selector: &GrantSelector,
        context: &OrderContext,
        method: CollectionMethod,
        now: DateTime<Utc>,
    ) -> Result<AtcGrant> {
        match selector {
            GrantSelector::Id(id) => self.store.require_grant(*id),
            GrantSelector::AutoResolve {
                grantor_id,
                grantee_id,
            } => self
                .registry
                .find_applicable(*grantor_id, *grantee_id, context, method, now),
        }
    }

    fn validate_amount(&self, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "collection amount must be positive, got {}",
                amount
            )));
        }
        if amount.normalize().scale() > self.minor_units {
            return Err(Error::Validation(format!(
                "amount {} has more than {} decimal places",
                amount, self.minor_units
            )));
        }
        Ok(())
    }

    fn hand_off_instant(&self, grant_id: Uuid, collection_id: Uuid) {
        let Some(tx) = &self.instant_tx else {
            return;
        };
        let job = InstantSettlement {
            grant_id,
            collection_id,
        };
        // Missed hand-offs are picked up by the scheduler sweep
        if let Err(e) = tx.try_send(job) {
            warn!(
                grant_id = %grant_id,
                collection_id = %collection_id,
                error = %e,
                "Instant settlement queue unavailable"
            );
        }
    }
}

fn in_range(at: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |f| at >= f) && to.map_or(true, |t| at < t)
}
