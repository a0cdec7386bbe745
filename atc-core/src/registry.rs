//! Grant registry
//!
//! Owns the grant lifecycle and the authority tree. A party may grant
//! authority if it is a configured root authority, or if it is the grantee
//! of an active parent grant whose whole ancestor chain is active.
//!
//! Grants of the same grantor/grantee pair may coexist only if they cannot
//! both match one collection: overlapping scopes of equal specificity with
//! overlapping methods are refused at creation, approval and reinstatement.

use crate::commission::validate_terms;
use crate::config::GrantPolicy;
use crate::events::{AtcEvent, EventBus};
use crate::metrics::Metrics;
use crate::storage::AtcStore;
use crate::types::*;
use crate::{error::retry_on_conflict, Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Request to create a grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGrantRequest {
    /// Party delegating authority
    pub grantor_id: PartyId,
    /// Grantor role
    pub grantor_type: PartyType,
    /// Grantor display name
    pub grantor_name: String,
    /// Party receiving authority
    pub grantee_id: PartyId,
    /// Grantee role
    pub grantee_type: PartyType,
    /// Grantee display name
    pub grantee_name: String,
    /// What may be collected for
    pub scope: GrantScope,
    /// How it may be collected
    pub methods: MethodFilter,
    /// Per-transaction cap
    pub max_per_transaction: Option<Decimal>,
    /// Lifetime cap
    pub cumulative_limit: Option<Decimal>,
    /// Commission terms
    pub commission: CommissionTerms,
    /// Settlement terms
    pub settlement: SettlementTerms,
    /// Start of validity
    pub effective_from: DateTime<Utc>,
    /// End of validity
    pub effective_to: Option<DateTime<Utc>>,
    /// Parent grant conferring the grantor's authority
    pub parent_grant_id: Option<Uuid>,
    /// Signed terms document
    pub terms_document_url: Option<String>,
}

/// A grant and its sub-grants
#[derive(Debug, Clone, Serialize)]
pub struct GrantNode {
    /// The grant
    pub grant: AtcGrant,
    /// Grants whose parent is this grant
    pub children: Vec<GrantNode>,
}

impl GrantNode {
    /// Number of grants in this subtree
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(GrantNode::size).sum::<usize>()
    }
}

/// Result of a revocation
#[derive(Debug, Clone)]
pub struct Revocation {
    /// The revoked grant
    pub grant: AtcGrant,
    /// Unsettled collections flagged for reconciliation
    pub flagged: Vec<Uuid>,
}

/// Grant registry
pub struct GrantRegistry {
    store: Arc<dyn AtcStore>,
    policy: RwLock<GrantPolicy>,
    currency: Currency,
    events: EventBus,
    metrics: Metrics,
    /// Serialises conflict check + activation per grantor/grantee pair
    pair_locks: DashMap<(PartyId, PartyId), Arc<Mutex<()>>>,
}

impl GrantRegistry {
    /// Create a registry
    pub fn new(
        store: Arc<dyn AtcStore>,
        policy: GrantPolicy,
        currency: Currency,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            policy: RwLock::new(policy),
            currency,
            events,
            metrics,
            pair_locks: DashMap::new(),
        }
    }

    /// Allow `party` to grant without a parent grant
    pub fn register_root_authority(&self, party: PartyId) {
        let mut policy = self.policy.write();
        if !policy.root_authorities.contains(&party) {
            policy.root_authorities.push(party);
            info!(party = %party, "Root authority registered");
        }
    }

    /// Create a grant
    pub fn create(&self, req: CreateGrantRequest, now: DateTime<Utc>) -> Result<AtcGrant> {
        self.validate_request(&req)?;
        self.check_authority(req.grantor_id, req.grantee_id, req.parent_grant_id, now)?;
        self.check_conflicts(
            req.grantor_id,
            req.grantee_id,
            &req.scope,
            &req.methods,
            None,
        )?;

        let status = if self.policy.read().require_approval {
            GrantStatus::PendingApproval
        } else {
            GrantStatus::Draft
        };

        let id = Uuid::now_v7();
        let grant = AtcGrant {
            id,
            reference: short_reference("ATC", id),
            currency: self.currency,
            grantor_id: req.grantor_id,
            grantor_type: req.grantor_type,
            grantor_name: req.grantor_name,
            grantee_id: req.grantee_id,
            grantee_type: req.grantee_type,
            grantee_name: req.grantee_name,
            scope: req.scope,
            methods: req.methods,
            max_per_transaction: req.max_per_transaction,
            cumulative_limit: req.cumulative_limit,
            cumulative_collected: Decimal::ZERO,
            commission: req.commission,
            settlement: req.settlement,
            status,
            effective_from: req.effective_from,
            effective_to: req.effective_to,
            status_reason: None,
            parent_grant_id: req.parent_grant_id,
            approved_by: None,
            approved_at: None,
            terms_document_url: req.terms_document_url,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.store.insert_grant(&grant)?;
        self.metrics.record_grant_created();

        info!(
            grant_id = %grant.id,
            reference = %grant.reference,
            grantor = %grant.grantor_id,
            grantee = %grant.grantee_id,
            status = %grant.status,
            "Grant created"
        );
        self.events.emit(AtcEvent::GrantCreated {
            grant_id: grant.id,
            grantor_id: grant.grantor_id,
            grantee_id: grant.grantee_id,
            status: grant.status,
        });

        Ok(grant)
    }

    /// Draft -> pending-approval
    pub fn submit(&self, id: Uuid, now: DateTime<Utc>) -> Result<AtcGrant> {
        self.change_status(id, GrantStatus::PendingApproval, now, |_| Ok(()))
    }

    /// Pending-approval -> active
    pub fn approve(&self, id: Uuid, approver: PartyId, now: DateTime<Utc>) -> Result<AtcGrant> {
        let pair = self.pair_lock(id)?;
        let _guard = pair.lock();
        let grant = self.change_status(id, GrantStatus::Active, now, |g| {
            if g.status != GrantStatus::PendingApproval {
                return Err(Error::InvalidTransition(format!(
                    "grant {} is {}, only pending grants can be approved",
                    g.reference, g.status
                )));
            }
            self.check_authority(g.grantor_id, g.grantee_id, g.parent_grant_id, now)?;
            self.check_conflicts(g.grantor_id, g.grantee_id, &g.scope, &g.methods, Some(g.id))?;
            g.approved_by = Some(approver);
            g.approved_at = Some(now);
            Ok(())
        })?;

        self.events.emit(AtcEvent::GrantApproved {
            grant_id: id,
            approved_by: approver,
        });
        Ok(grant)
    }

    /// Active -> suspended
    pub fn suspend(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<AtcGrant> {
        let grant = self.change_status(id, GrantStatus::Suspended, now, |g| {
            g.status_reason = Some(reason.to_string());
            Ok(())
        })?;
        self.events.emit(AtcEvent::GrantSuspended {
            grant_id: id,
            reason: reason.to_string(),
        });
        Ok(grant)
    }

    /// Suspended -> active
    pub fn reinstate(&self, id: Uuid, now: DateTime<Utc>) -> Result<AtcGrant> {
        let pair = self.pair_lock(id)?;
        let _guard = pair.lock();
        let grant = self.change_status(id, GrantStatus::Active, now, |g| {
            if g.status != GrantStatus::Suspended {
                return Err(Error::InvalidTransition(format!(
                    "grant {} is {}, only suspended grants can be reinstated",
                    g.reference, g.status
                )));
            }
            self.check_conflicts(g.grantor_id, g.grantee_id, &g.scope, &g.methods, Some(g.id))?;
            g.status_reason = None;
            Ok(())
        })?;
        self.events.emit(AtcEvent::GrantReinstated { grant_id: id });
        Ok(grant)
    }

    /// Revoke a grant and flag its unsettled collections.
    ///
    /// Collections are never deleted; open batches are the settlement side's
    /// concern.
    pub fn revoke(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Revocation> {
        let grant = self.change_status(id, GrantStatus::Revoked, now, |g| {
            g.status_reason = Some(reason.to_string());
            Ok(())
        })?;

        let mut flagged = Vec::new();
        for c in self.store.collections_for_grant(id)? {
            if !matches!(
                c.settlement_status,
                SettlementStatus::Pending | SettlementStatus::Scheduled
            ) {
                continue;
            }
            retry_on_conflict(|| {
                let mut current = self.store.require_collection(c.id)?;
                current.needs_reconciliation = true;
                self.store.update_collection(&current)
            })?;
            flagged.push(c.id);
        }

        warn!(
            grant_id = %id,
            reason = %reason,
            flagged = flagged.len(),
            "Grant revoked"
        );
        self.events.emit(AtcEvent::GrantRevoked {
            grant_id: id,
            reason: reason.to_string(),
        });
        if !flagged.is_empty() {
            self.events.emit(AtcEvent::CollectionsFlagged {
                grant_id: id,
                count: flagged.len(),
            });
        }

        Ok(Revocation { grant, flagged })
    }

    /// Expire active or suspended grants whose effective_to has passed
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut expired = Vec::new();
        for grant in self.store.list_grants()? {
            let due = matches!(grant.status, GrantStatus::Active | GrantStatus::Suspended)
                && grant.effective_to.is_some_and(|to| to <= now);
            if !due {
                continue;
            }
            match self.change_status(grant.id, GrantStatus::Expired, now, |_| Ok(())) {
                Ok(_) => {
                    self.events.emit(AtcEvent::GrantExpired { grant_id: grant.id });
                    expired.push(grant.id);
                }
                // Concurrently revoked
                Err(Error::InvalidTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Most specific active grant covering the order
    pub fn find_applicable(
        &self,
        grantor_id: PartyId,
        grantee_id: PartyId,
        ctx: &OrderContext,
        method: CollectionMethod,
        now: DateTime<Utc>,
    ) -> Result<AtcGrant> {
        self.store
            .list_grants()?
            .into_iter()
            .filter(|g| {
                g.grantor_id == grantor_id
                    && g.grantee_id == grantee_id
                    && g.is_active_at(now)
                    && g.methods.allows(method)
                    && g.scope.covers(ctx)
            })
            .max_by(|a, b| {
                a.scope
                    .specificity()
                    .cmp(&b.scope.specificity())
                    .then(b.created_at.cmp(&a.created_at))
            })
            .ok_or_else(|| {
                Error::NoGrantFound(format!(
                    "no active grant from {} to {} covers this {} collection",
                    grantor_id, grantee_id, method
                ))
            })
    }

    /// Get a grant
    pub fn get(&self, id: Uuid) -> Result<AtcGrant> {
        self.store.require_grant(id)
    }

    /// Grants issued by a party
    pub fn list_by_grantor(&self, grantor_id: PartyId) -> Result<Vec<AtcGrant>> {
        Ok(self
            .store
            .list_grants()?
            .into_iter()
            .filter(|g| g.grantor_id == grantor_id)
            .collect())
    }

    /// Grants held by a party
    pub fn list_by_grantee(&self, grantee_id: PartyId) -> Result<Vec<AtcGrant>> {
        Ok(self
            .store
            .list_grants()?
            .into_iter()
            .filter(|g| g.grantee_id == grantee_id)
            .collect())
    }

    /// Tree of grants under `root_id`
    pub fn hierarchy(&self, root_id: Uuid) -> Result<GrantNode> {
        let grants = self.store.list_grants()?;
        let root_idx = grants
            .iter()
            .position(|g| g.id == root_id)
            .ok_or_else(|| Error::GrantNotFound(root_id.to_string()))?;

        let mut children: HashMap<Uuid, Vec<usize>> = HashMap::new();
        for (idx, g) in grants.iter().enumerate() {
            if let Some(parent) = g.parent_grant_id {
                children.entry(parent).or_default().push(idx);
            }
        }

        fn build(
            idx: usize,
            grants: &[AtcGrant],
            children: &HashMap<Uuid, Vec<usize>>,
            seen: &mut HashSet<Uuid>,
        ) -> GrantNode {
            let grant = grants[idx].clone();
            seen.insert(grant.id);
            let mut kids = Vec::new();
            if let Some(ids) = children.get(&grant.id) {
                for &c in ids {
                    if !seen.contains(&grants[c].id) {
                        kids.push(build(c, grants, children, seen));
                    }
                }
            }
            GrantNode {
                grant,
                children: kids,
            }
        }

        let mut seen = HashSet::new();
        Ok(build(root_idx, &grants, &children, &mut seen))
    }

    /// Lock shared by every grant between the same grantor and grantee
    fn pair_lock(&self, id: Uuid) -> Result<Arc<Mutex<()>>> {
        let grant = self.store.require_grant(id)?;
        Ok(self
            .pair_locks
            .entry((grant.grantor_id, grant.grantee_id))
            .or_default()
            .clone())
    }

    /// Apply a status transition with one retry on optimistic conflict
    fn change_status(
        &self,
        id: Uuid,
        next: GrantStatus,
        now: DateTime<Utc>,
        prepare: impl Fn(&mut AtcGrant) -> Result<()>,
    ) -> Result<AtcGrant> {
        let grant = retry_on_conflict(|| {
            let mut grant = self.store.require_grant(id)?;
            prepare(&mut grant)?;
            let from = grant.status;
            grant.transition(next, now)?;
            let stored = self.store.update_grant(&grant)?;
            info!(
                grant_id = %id,
                from = %from,
                to = %next,
                "Grant status changed"
            );
            Ok(stored)
        })?;
        self.metrics.record_grant_transition(&next.to_string());
        Ok(grant)
    }

    fn validate_request(&self, req: &CreateGrantRequest) -> Result<()> {
        if req.grantor_id == req.grantee_id {
            return Err(Error::Validation(
                "grantor and grantee must be different parties".to_string(),
            ));
        }
        req.scope.validate()?;
        req.methods.validate()?;
        validate_terms(&req.commission)?;
        req.settlement.validate()?;

        let positive = |v: Option<Decimal>| v.map_or(true, |v| v > Decimal::ZERO);
        if !positive(req.max_per_transaction) || !positive(req.cumulative_limit) {
            return Err(Error::Validation("limits must be positive".to_string()));
        }
        if let (Some(max), Some(total)) = (req.max_per_transaction, req.cumulative_limit) {
            if max > total {
                return Err(Error::Validation(format!(
                    "per-transaction limit {} exceeds cumulative limit {}",
                    max, total
                )));
            }
        }
        if let Some(to) = req.effective_to {
            if to <= req.effective_from {
                return Err(Error::Validation(
                    "effective_to must be after effective_from".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Grantor standing: root authority, or grantee of an active parent
    /// whose ancestors are all active and never loop back to the grantee.
    fn check_authority(
        &self,
        grantor_id: PartyId,
        grantee_id: PartyId,
        parent_grant_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(parent_id) = parent_grant_id else {
            if self.policy.read().root_authorities.contains(&grantor_id) {
                return Ok(());
            }
            return Err(Error::AuthorityConflict(format!(
                "{} holds no grant and is not a root authority",
                grantor_id
            )));
        };

        let parent = self.store.get_grant(parent_id)?.ok_or_else(|| {
            Error::AuthorityConflict(format!("parent grant {} not found", parent_id))
        })?;
        if parent.grantee_id != grantor_id {
            return Err(Error::AuthorityConflict(format!(
                "parent grant {} was issued to {}, not {}",
                parent.reference, parent.grantee_id, grantor_id
            )));
        }

        let max_depth = self.policy.read().max_hierarchy_depth;
        let mut visited = HashSet::new();
        let mut current = Some(parent);
        let mut depth = 0usize;

        while let Some(ancestor) = current {
            depth += 1;
            if depth > max_depth {
                return Err(Error::AuthorityConflict(format!(
                    "grant chain deeper than {}",
                    max_depth
                )));
            }
            if !visited.insert(ancestor.id) {
                return Err(Error::AuthorityConflict(format!(
                    "cycle in grant chain at {}",
                    ancestor.reference
                )));
            }
            if ancestor.grantor_id == grantee_id {
                return Err(Error::AuthorityConflict(format!(
                    "{} already delegates authority in this chain",
                    grantee_id
                )));
            }
            if !ancestor.is_active_at(now) {
                return Err(Error::AuthorityConflict(format!(
                    "ancestor grant {} is {}",
                    ancestor.reference, ancestor.status
                )));
            }
            current = match ancestor.parent_grant_id {
                Some(pid) => Some(self.store.get_grant(pid)?.ok_or_else(|| {
                    Error::AuthorityConflict(format!("ancestor grant {} not found", pid))
                })?),
                None => {
                    if !self.policy.read().root_authorities.contains(&ancestor.grantor_id) {
                        return Err(Error::AuthorityConflict(format!(
                            "chain root {} is not a root authority",
                            ancestor.grantor_id
                        )));
                    }
                    None
                }
            };
        }
        Ok(())
    }

    fn check_conflicts(
        &self,
        grantor_id: PartyId,
        grantee_id: PartyId,
        scope: &GrantScope,
        methods: &MethodFilter,
        exclude: Option<Uuid>,
    ) -> Result<()> {
        let conflict = self.store.list_grants()?.into_iter().find(|g| {
            Some(g.id) != exclude
                && g.status == GrantStatus::Active
                && g.grantor_id == grantor_id
                && g.grantee_id == grantee_id
                && g.scope.overlaps(scope)
                && g.methods.overlaps(methods)
        });
        match conflict {
            Some(existing) => Err(Error::AuthorityConflict(format!(
                "overlaps active grant {} ({} scope)",
                existing.reference,
                existing.scope.kind()
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn registry() -> (GrantRegistry, PartyId) {
        let root = PartyId::random();
        let policy = GrantPolicy {
            root_authorities: vec![root],
            ..Default::default()
        };
        let registry = GrantRegistry::new(
            Arc::new(MemoryStore::new()),
            policy,
            Currency::KES,
            EventBus::default(),
            Metrics::new().unwrap(),
        );
        (registry, root)
    }

    fn request(grantor: PartyId, grantee: PartyId, now: DateTime<Utc>) -> CreateGrantRequest {
        CreateGrantRequest {
            grantor_id: grantor,
            grantor_type: PartyType::Manufacturer,
            grantor_name: "Acme".into(),
            grantee_id: grantee,
            grantee_type: PartyType::Distributor,
            grantee_name: "Rift".into(),
            scope: GrantScope::AllProducts,
            methods: MethodFilter::All,
            max_per_transaction: None,
            cumulative_limit: None,
            commission: CommissionTerms::percentage(Decimal::from(5)),
            settlement: SettlementTerms {
                frequency: SettlementFrequency::Daily,
                delay_days: 0,
                settlement_day: 0,
                account: SettlementAccount::mobile_money("mpesa", "+254700000000", "Acme"),
            },
            effective_from: now - Duration::hours(1),
            effective_to: None,
            parent_grant_id: None,
            terms_document_url: None,
        }
    }

    fn activate(registry: &GrantRegistry, id: Uuid, now: DateTime<Utc>) -> AtcGrant {
        registry.submit(id, now).unwrap();
        registry.approve(id, PartyId::random(), now).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let (registry, root) = registry();
        let now = Utc::now();
        let grant = registry.create(request(root, PartyId::random(), now), now).unwrap();
        assert_eq!(grant.status, GrantStatus::Draft);
        assert!(grant.reference.starts_with("ATC"));

        let active = activate(&registry, grant.id, now);
        assert_eq!(active.status, GrantStatus::Active);
        assert!(active.approved_at.is_some());

        let suspended = registry.suspend(grant.id, "audit", now).unwrap();
        assert_eq!(suspended.status_reason.as_deref(), Some("audit"));
        assert_eq!(registry.reinstate(grant.id, now).unwrap().status, GrantStatus::Active);

        let revoked = registry.revoke(grant.id, "contract ended", now).unwrap();
        assert_eq!(revoked.grant.status, GrantStatus::Revoked);
        assert!(matches!(
            registry.approve(grant.id, root, now),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_unauthorized_grantor_rejected() {
        let (registry, _) = registry();
        let now = Utc::now();
        let result = registry.create(request(PartyId::random(), PartyId::random(), now), now);
        assert!(matches!(result, Err(Error::AuthorityConflict(_))));
    }

    #[test]
    fn test_sub_grant_needs_active_parent() {
        let (registry, root) = registry();
        let now = Utc::now();
        let distributor = PartyId::random();
        let agent = PartyId::random();

        let parent = registry.create(request(root, distributor, now), now).unwrap();
        let mut child_req = request(distributor, agent, now);
        child_req.parent_grant_id = Some(parent.id);

        // Parent still draft
        assert!(matches!(
            registry.create(child_req.clone(), now),
            Err(Error::AuthorityConflict(_))
        ));

        activate(&registry, parent.id, now);
        let child = registry.create(child_req.clone(), now).unwrap();
        assert_eq!(child.parent_grant_id, Some(parent.id));

        // Wrong grantor for this parent
        let mut stranger = request(agent, PartyId::random(), now);
        stranger.parent_grant_id = Some(parent.id);
        assert!(registry.create(stranger, now).is_err());
    }

    #[test]
    fn test_delegation_back_up_the_chain_rejected() {
        let (registry, root) = registry();
        let now = Utc::now();
        let distributor = PartyId::random();
        let parent = registry.create(request(root, distributor, now), now).unwrap();
        activate(&registry, parent.id, now);

        let mut back = request(distributor, root, now);
        back.parent_grant_id = Some(parent.id);
        assert!(matches!(
            registry.create(back, now),
            Err(Error::AuthorityConflict(_))
        ));
    }

    #[test]
    fn test_equal_specificity_overlap_rejected() {
        let (registry, root) = registry();
        let now = Utc::now();
        let grantee = PartyId::random();

        let mut first = request(root, grantee, now);
        first.scope = GrantScope::GeographicArea(BTreeSet::from(["nairobi".to_string()]));
        let g = registry.create(first.clone(), now).unwrap();
        activate(&registry, g.id, now);

        assert!(matches!(
            registry.create(first.clone(), now),
            Err(Error::AuthorityConflict(_))
        ));

        // Different specificity may coexist
        let mut broader = request(root, grantee, now);
        broader.scope = GrantScope::AllProducts;
        assert!(registry.create(broader, now).is_ok());

        // A narrower method filter still overlaps "all methods"
        let mut cheque_only = first;
        cheque_only.methods = MethodFilter::single(CollectionMethod::Cheque);
        assert!(registry.create(cheque_only, now).is_err());
    }

    #[test]
    fn test_find_applicable_prefers_specific_scope() {
        let (registry, root) = registry();
        let now = Utc::now();
        let grantee = PartyId::random();

        let general = registry.create(request(root, grantee, now), now).unwrap();
        activate(&registry, general.id, now);

        let mut specific = request(root, grantee, now);
        specific.scope = GrantScope::SpecificProducts(BTreeSet::from(["sku-1".to_string()]));
        let specific = registry.create(specific, now).unwrap();
        activate(&registry, specific.id, now);

        let ctx = OrderContext {
            product_ids: vec!["sku-1".into()],
            ..Default::default()
        };
        let found = registry
            .find_applicable(root, grantee, &ctx, CollectionMethod::Cash, now)
            .unwrap();
        assert_eq!(found.id, specific.id);

        let other = OrderContext {
            product_ids: vec!["sku-2".into()],
            ..Default::default()
        };
        let found = registry
            .find_applicable(root, grantee, &other, CollectionMethod::Cash, now)
            .unwrap();
        assert_eq!(found.id, general.id);

        assert!(matches!(
            registry.find_applicable(grantee, root, &ctx, CollectionMethod::Cash, now),
            Err(Error::NoGrantFound(_))
        ));
    }

    #[test]
    fn test_expire_due() {
        let (registry, root) = registry();
        let now = Utc::now();
        let mut req = request(root, PartyId::random(), now);
        req.effective_to = Some(now + Duration::days(1));
        let grant = registry.create(req, now).unwrap();
        activate(&registry, grant.id, now);

        assert!(registry.expire_due(now).unwrap().is_empty());
        let later = now + Duration::days(2);
        assert_eq!(registry.expire_due(later).unwrap(), vec![grant.id]);
        assert_eq!(registry.get(grant.id).unwrap().status, GrantStatus::Expired);
    }

    #[test]
    fn test_hierarchy() {
        let (registry, root) = registry();
        let now = Utc::now();
        let distributor = PartyId::random();
        let parent = registry.create(request(root, distributor, now), now).unwrap();
        activate(&registry, parent.id, now);

        for _ in 0..2 {
            let mut req = request(distributor, PartyId::random(), now);
            req.parent_grant_id = Some(parent.id);
            registry.create(req, now).unwrap();
        }

        let tree = registry.hierarchy(parent.id).unwrap();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.size(), 3);
        assert_eq!(registry.list_by_grantor(distributor).unwrap().len(), 2);
        assert_eq!(registry.list_by_grantee(distributor).unwrap().len(), 1);
    }

    #[test]
    fn test_require_approval_policy() {
        let (registry, root) = registry();
        registry.policy.write().require_approval = true;
        let now = Utc::now();
        let grant = registry.create(request(root, PartyId::random(), now), now).unwrap();
        assert_eq!(grant.status, GrantStatus::PendingApproval);
    }

    #[test]
    fn test_hierarchy_nested() {
        let (registry, root) = registry();
        let now = Utc::now();
        let distributor = PartyId::random();
        let agent = PartyId::random();

        let top = registry.create(request(root, distributor, now), now).unwrap();
        activate(&registry, top.id, now);
        let mut mid_req = request(distributor, agent, now);
        mid_req.parent_grant_id = Some(top.id);
        let mid = registry.create(mid_req, now).unwrap();
        activate(&registry, mid.id, now);
        let mut leaf_req = request(agent, PartyId::random(), now);
        leaf_req.parent_grant_id = Some(mid.id);
        registry.create(leaf_req, now).unwrap();

        let tree = registry.hierarchy(top.id).unwrap();
        assert_eq!(tree.size(), 3);
        assert_eq!(tree.children[0].grant.id, mid.id);
        assert_eq!(tree.children[0].children.len(), 1);
        assert!(tree.children[0].children[0].children.is_empty());
    }

    #[test]
    fn test_concurrent_approvals_activate_one_overlapping_grant() {
        let (registry, root) = registry();
        let now = Utc::now();
        let grantee = PartyId::random();

        // Pending grants do not conflict with each other at creation
        let ids: Vec<Uuid> = (0..8)
            .map(|_| {
                let grant = registry.create(request(root, grantee, now), now).unwrap();
                registry.submit(grant.id, now).unwrap();
                grant.id
            })
            .collect();

        let registry = &registry;
        let approved = std::thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|&id| scope.spawn(move || registry.approve(id, root, now)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| r.is_ok())
                .count()
        });

        assert_eq!(approved, 1);
        let active = registry
            .list_by_grantee(grantee)
            .unwrap()
            .into_iter()
            .filter(|g| g.status == GrantStatus::Active)
            .count();
        assert_eq!(active, 1);
    }
}
