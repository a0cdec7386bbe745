//! Authority-to-Collect grants: scope, commission and settlement terms, lifecycle

use super::{Currency, PartyId, PartyType};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// What a grant authorizes the grantee to collect for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantScope {
    /// Any order of the grantor
    AllProducts,
    /// Orders whose product categories are all in the set
    ProductCategory(BTreeSet<String>),
    /// Orders whose products are all in the set
    SpecificProducts(BTreeSet<String>),
    /// Orders placed by one of these customers
    SpecificCustomers(BTreeSet<String>),
    /// Orders delivered in one of these areas
    GeographicArea(BTreeSet<String>),
}

impl GrantScope {
    /// Rank used to pick the most specific grant when several match.
    /// Higher is more specific.
    pub fn specificity(&self) -> u8 {
        match self {
            GrantScope::SpecificProducts(_) => 4,
            GrantScope::ProductCategory(_) => 3,
            GrantScope::SpecificCustomers(_) => 2,
            GrantScope::GeographicArea(_) => 1,
            GrantScope::AllProducts => 0,
        }
    }

    /// Scope values (None for all-products)
    pub fn values(&self) -> Option<&BTreeSet<String>> {
        match self {
            GrantScope::AllProducts => None,
            GrantScope::ProductCategory(v)
            | GrantScope::SpecificProducts(v)
            | GrantScope::SpecificCustomers(v)
            | GrantScope::GeographicArea(v) => Some(v),
        }
    }

    /// Stable name of the scope kind
    pub fn kind(&self) -> &'static str {
        match self {
            GrantScope::AllProducts => "ALL_PRODUCTS",
            GrantScope::ProductCategory(_) => "PRODUCT_CATEGORY",
            GrantScope::SpecificProducts(_) => "SPECIFIC_PRODUCTS",
            GrantScope::SpecificCustomers(_) => "SPECIFIC_CUSTOMERS",
            GrantScope::GeographicArea(_) => "GEOGRAPHIC_AREA",
        }
    }

    /// Check the scope is well-formed
    pub fn validate(&self) -> Result<()> {
        if let Some(values) = self.values() {
            if values.is_empty() {
                return Err(Error::Validation(format!(
                    "{} scope requires at least one value",
                    self.kind()
                )));
            }
            if values.iter().any(|v| v.trim().is_empty()) {
                return Err(Error::Validation(format!(
                    "{} scope contains a blank value",
                    self.kind()
                )));
            }
        }
        Ok(())
    }

    /// Whether an order falls inside this scope
    pub fn covers(&self, ctx: &OrderContext) -> bool {
        fn all_in(items: &[String], set: &BTreeSet<String>) -> bool {
            !items.is_empty() && items.iter().all(|i| set.contains(i))
        }

        match self {
            GrantScope::AllProducts => true,
            GrantScope::ProductCategory(set) => all_in(&ctx.category_ids, set),
            GrantScope::SpecificProducts(set) => all_in(&ctx.product_ids, set),
            GrantScope::SpecificCustomers(set) => {
                ctx.customer_id.as_ref().is_some_and(|c| set.contains(c))
            }
            GrantScope::GeographicArea(set) => {
                ctx.geo_area.as_ref().is_some_and(|a| set.contains(a))
            }
        }
    }

    /// Whether two scopes of equal specificity can match the same order
    pub fn overlaps(&self, other: &GrantScope) -> bool {
        if self.specificity() != other.specificity() {
            return false;
        }
        match (self.values(), other.values()) {
            (Some(a), Some(b)) => a.intersection(b).next().is_some(),
            _ => true,
        }
    }
}

/// Order attributes a collection is checked against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContext {
    /// Products on the order
    pub product_ids: Vec<String>,
    /// Categories of those products
    pub category_ids: Vec<String>,
    /// Buying customer
    pub customer_id: Option<String>,
    /// Delivery area
    pub geo_area: Option<String>,
}

/// Payment rails a grantee may collect through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionMethod {
    /// Cash in hand
    Cash,
    /// Mobile money wallet
    MobileMoney,
    /// Bank transfer
    BankTransfer,
    /// Cheque
    Cheque,
    /// Offset against a purchase on credit
    CreditAgainstPurchase,
}

impl fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionMethod::Cash => "CASH",
            CollectionMethod::MobileMoney => "MOBILE_MONEY",
            CollectionMethod::BankTransfer => "BANK_TRANSFER",
            CollectionMethod::Cheque => "CHEQUE",
            CollectionMethod::CreditAgainstPurchase => "CREDIT_AGAINST_PURCHASE",
        };
        f.write_str(s)
    }
}

/// Collection method filter on a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodFilter {
    /// Every method
    All,
    /// Only the listed methods
    Only(BTreeSet<CollectionMethod>),
}

impl MethodFilter {
    /// Filter allowing a single method
    pub fn single(method: CollectionMethod) -> Self {
        MethodFilter::Only(BTreeSet::from([method]))
    }

    /// Whether `method` may be used
    pub fn allows(&self, method: CollectionMethod) -> bool {
        match self {
            MethodFilter::All => true,
            MethodFilter::Only(set) => set.contains(&method),
        }
    }

    /// Whether some method is allowed by both filters
    pub fn overlaps(&self, other: &MethodFilter) -> bool {
        match (self, other) {
            (MethodFilter::Only(a), MethodFilter::Only(b)) => a.intersection(b).next().is_some(),
            _ => true,
        }
    }

    /// Check the filter is well-formed
    pub fn validate(&self) -> Result<()> {
        if let MethodFilter::Only(set) = self {
            if set.is_empty() {
                return Err(Error::Validation(
                    "collection method filter must allow at least one method".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Commission pricing model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionKind {
    /// gross × rate / 100
    Percentage,
    /// Fixed amount per collection
    Flat,
    /// Percentage chosen by the collection's own gross amount
    Tiered,
    /// flat + gross × rate / 100
    Hybrid,
}

/// One band of a tiered commission schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionTier {
    /// Inclusive lower bound
    pub min_amount: Decimal,
    /// Inclusive upper bound (None = open-ended)
    pub max_amount: Option<Decimal>,
    /// Percentage rate
    pub rate: Decimal,
}

impl CommissionTier {
    /// Create a tier
    pub fn new(min_amount: Decimal, max_amount: Option<Decimal>, rate: Decimal) -> Self {
        Self {
            min_amount,
            max_amount,
            rate,
        }
    }

    /// Whether `gross` falls inside the tier
    pub fn contains(&self, gross: Decimal) -> bool {
        self.min_amount <= gross && self.max_amount.map_or(true, |max| gross <= max)
    }
}

/// Commission the grantee keeps from each collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionTerms {
    /// Pricing model
    pub kind: CommissionKind,
    /// Percentage rate (percentage and hybrid)
    pub rate: Decimal,
    /// Flat amount (flat and hybrid)
    pub flat_amount: Decimal,
    /// Ordered tiers (tiered)
    pub tiers: Vec<CommissionTier>,
    /// Lower clamp
    pub min_commission: Option<Decimal>,
    /// Upper clamp
    pub max_commission: Option<Decimal>,
}

impl CommissionTerms {
    /// Percentage of gross
    pub fn percentage(rate: Decimal) -> Self {
        Self {
            kind: CommissionKind::Percentage,
            rate,
            flat_amount: Decimal::ZERO,
            tiers: Vec::new(),
            min_commission: None,
            max_commission: None,
        }
    }

    /// Fixed amount
    pub fn flat(amount: Decimal) -> Self {
        Self {
            kind: CommissionKind::Flat,
            flat_amount: amount,
            ..Self::percentage(Decimal::ZERO)
        }
    }

    /// Tiered percentage
    pub fn tiered(tiers: Vec<CommissionTier>) -> Self {
        Self {
            kind: CommissionKind::Tiered,
            tiers,
            ..Self::percentage(Decimal::ZERO)
        }
    }

    /// Flat amount plus percentage
    pub fn hybrid(flat_amount: Decimal, rate: Decimal) -> Self {
        Self {
            kind: CommissionKind::Hybrid,
            flat_amount,
            ..Self::percentage(rate)
        }
    }

    /// Add min/max clamps
    pub fn with_bounds(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min_commission = min;
        self.max_commission = max;
        self
    }
}

/// How often collected funds are paid out to the grantor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementFrequency {
    /// Right after each collection
    Instant,
    /// Once per day
    Daily,
    /// Once per week on `settlement_day`
    Weekly,
    /// Every other week on `settlement_day`
    Biweekly,
    /// Once per month on `settlement_day`
    Monthly,
    /// Only when explicitly requested
    OnDemand,
}

/// Bank or mobile-money account receiving settlements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAccount {
    /// Bank code
    pub bank_code: String,
    /// Bank account number
    pub account_number: String,
    /// Account holder name
    pub account_name: String,
    /// Mobile-money phone number
    pub phone: String,
    /// Mobile-money provider
    pub provider: String,
}

impl SettlementAccount {
    /// Bank account
    pub fn bank(
        bank_code: impl Into<String>,
        account_number: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            bank_code: bank_code.into(),
            account_number: account_number.into(),
            account_name: account_name.into(),
            ..Default::default()
        }
    }

    /// Mobile-money wallet
    pub fn mobile_money(
        provider: impl Into<String>,
        phone: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            phone: phone.into(),
            account_name: account_name.into(),
            ..Default::default()
        }
    }

    /// Destination string handed to the payment rail
    pub fn destination(&self) -> Option<String> {
        if !self.account_number.is_empty() {
            Some(format!("{}:{}", self.bank_code, self.account_number))
        } else if !self.phone.is_empty() {
            Some(format!("{}:{}", self.provider, self.phone))
        } else {
            None
        }
    }
}

/// When and where settlements are paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTerms {
    /// Payout cadence
    pub frequency: SettlementFrequency,
    /// Days after collection before funds are due
    pub delay_days: u32,
    /// Weekday (0 = Monday) for weekly/biweekly, day of month (1-28) for monthly
    pub settlement_day: u32,
    /// Destination account
    pub account: SettlementAccount,
}

impl SettlementTerms {
    /// Check the terms are well-formed
    pub fn validate(&self) -> Result<()> {
        match self.frequency {
            SettlementFrequency::Weekly | SettlementFrequency::Biweekly
                if self.settlement_day > 6 =>
            {
                return Err(Error::Validation(format!(
                    "weekly settlement day must be 0-6, got {}",
                    self.settlement_day
                )));
            }
            SettlementFrequency::Monthly if !(1..=28).contains(&self.settlement_day) => {
                return Err(Error::Validation(format!(
                    "monthly settlement day must be 1-28, got {}",
                    self.settlement_day
                )));
            }
            _ => {}
        }
        if self.account.destination().is_none() {
            return Err(Error::Validation(
                "settlement account needs an account number or phone".to_string(),
            ));
        }
        Ok(())
    }
}

/// Grant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GrantStatus {
    /// Created, not yet submitted
    Draft = 1,
    /// Awaiting approval
    PendingApproval = 2,
    /// Collections allowed
    Active = 3,
    /// Temporarily halted
    Suspended = 4,
    /// effective_to passed (terminal)
    Expired = 5,
    /// Administratively ended (terminal)
    Revoked = 6,
}

impl GrantStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, GrantStatus::Expired | GrantStatus::Revoked)
    }

    /// Transition table
    pub fn can_transition_to(&self, next: GrantStatus) -> bool {
        use GrantStatus::*;
        matches!(
            (self, next),
            (Draft, PendingApproval)
                | (PendingApproval, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Draft | PendingApproval | Active | Suspended, Revoked)
                | (Draft | PendingApproval | Active | Suspended, Expired)
        )
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GrantStatus::Draft => "DRAFT",
            GrantStatus::PendingApproval => "PENDING_APPROVAL",
            GrantStatus::Active => "ACTIVE",
            GrantStatus::Suspended => "SUSPENDED",
            GrantStatus::Expired => "EXPIRED",
            GrantStatus::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

/// An authorization edge in the grant tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtcGrant {
    /// Grant ID
    pub id: Uuid,
    /// Human-readable reference
    pub reference: String,
    /// Tenant currency
    pub currency: Currency,

    /// Party delegating authority
    pub grantor_id: PartyId,
    /// Grantor role (metadata)
    pub grantor_type: PartyType,
    /// Grantor display name
    pub grantor_name: String,
    /// Party receiving authority
    pub grantee_id: PartyId,
    /// Grantee role (metadata)
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
    /// Running total; only the limit enforcer's atomic reserve changes it
    pub cumulative_collected: Decimal,

    /// Commission the grantee keeps
    pub commission: CommissionTerms,
    /// Payout terms
    pub settlement: SettlementTerms,

    /// Lifecycle status
    pub status: GrantStatus,
    /// Start of validity (inclusive)
    pub effective_from: DateTime<Utc>,
    /// End of validity (exclusive)
    pub effective_to: Option<DateTime<Utc>>,
    /// Reason recorded on suspension or revocation
    pub status_reason: Option<String>,

    /// Parent grant in the hierarchy
    pub parent_grant_id: Option<Uuid>,

    /// Approver
    pub approved_by: Option<PartyId>,
    /// Approval time
    pub approved_at: Option<DateTime<Utc>>,
    /// Signed terms document
    pub terms_document_url: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped on every stored write
    pub version: u64,
}

impl AtcGrant {
    /// Whether `now` is inside `[effective_from, effective_to)`
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.effective_from <= now && self.effective_to.map_or(true, |to| now < to)
    }

    /// Active and inside its validity window
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == GrantStatus::Active && self.is_within_window(now)
    }

    /// Capacity left under the cumulative limit
    pub fn remaining_capacity(&self) -> Option<Decimal> {
        self.cumulative_limit
            .map(|limit| limit - self.cumulative_collected)
    }

    /// Apply a status transition, enforcing the transition table
    pub fn transition(&mut self, next: GrantStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "grant {} cannot move from {} to {}",
                self.reference, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
