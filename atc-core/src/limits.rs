//! Limit enforcement
//!
//! The check runs twice: once against a snapshot for a fast rejection, then
//! again inside the store's per-grant atomic reserve, where it is authoritative.

use crate::storage::{AtcStore, ReserveOutcome};
use crate::types::{AtcCollection, AtcGrant, CollectionMethod, GrantStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Why a collection was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitRejection {
    /// Grant is not active
    GrantInactive(GrantStatus),
    /// Outside [effective_from, effective_to)
    OutsideEffectiveWindow,
    /// Method not permitted by the grant
    MethodNotAllowed(CollectionMethod),
    /// Amount above the per-transaction cap
    PerTransactionExceeded {
        /// Requested amount
        amount: Decimal,
        /// Cap
        max: Decimal,
    },
    /// Cumulative cap would be exceeded
    CumulativeExceeded {
        /// Requested amount
        amount: Decimal,
        /// Current total
        cumulative: Decimal,
        /// Cap
        limit: Decimal,
    },
}

impl LimitRejection {
    /// Caller-facing error
    pub fn into_error(self, grant_reference: &str) -> Error {
        let msg = format!("grant {}: {}", grant_reference, self);
        match self {
            LimitRejection::PerTransactionExceeded { .. }
            | LimitRejection::CumulativeExceeded { .. } => Error::LimitExceeded(msg),
            _ => Error::CollectionNotAllowed(msg),
        }
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            LimitRejection::GrantInactive(_) => "inactive",
            LimitRejection::OutsideEffectiveWindow => "window",
            LimitRejection::MethodNotAllowed(_) => "method",
            LimitRejection::PerTransactionExceeded { .. } => "per_transaction",
            LimitRejection::CumulativeExceeded { .. } => "cumulative",
        }
    }
}

impl fmt::Display for LimitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitRejection::GrantInactive(status) => write!(f, "grant is {}", status),
            LimitRejection::OutsideEffectiveWindow => write!(f, "outside effective window"),
            LimitRejection::MethodNotAllowed(m) => write!(f, "method {} not allowed", m),
            LimitRejection::PerTransactionExceeded { amount, max } => {
                write!(f, "amount {} exceeds per-transaction limit {}", amount, max)
            }
            LimitRejection::CumulativeExceeded {
                amount,
                cumulative,
                limit,
            } => write!(
                f,
                "amount {} on top of {} collected exceeds cumulative limit {}",
                amount, cumulative, limit
            ),
        }
    }
}

/// Outcome of a reserve request
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Whether capacity was reserved
    pub accepted: bool,
    /// Rejection reason
    pub reason: Option<LimitRejection>,
    /// Cumulative total after the call
    pub cumulative: Decimal,
}

impl From<ReserveOutcome> for Reservation {
    fn from(outcome: ReserveOutcome) -> Self {
        match outcome {
            ReserveOutcome::Accepted { cumulative } => Self {
                accepted: true,
                reason: None,
                cumulative,
            },
            ReserveOutcome::Rejected {
                rejection,
                cumulative,
            } => Self {
                accepted: false,
                reason: Some(rejection),
                cumulative,
            },
        }
    }
}

/// Check a collection against a grant's state and caps
pub fn check(
    grant: &AtcGrant,
    amount: Decimal,
    method: CollectionMethod,
    now: DateTime<Utc>,
) -> std::result::Result<(), LimitRejection> {
    if grant.status != GrantStatus::Active {
        return Err(LimitRejection::GrantInactive(grant.status));
    }
    if !grant.is_within_window(now) {
        return Err(LimitRejection::OutsideEffectiveWindow);
    }
    if !grant.methods.allows(method) {
        return Err(LimitRejection::MethodNotAllowed(method));
    }
    if let Some(max) = grant.max_per_transaction {
        if amount > max {
            return Err(LimitRejection::PerTransactionExceeded { amount, max });
        }
    }
    if let Some(limit) = grant.cumulative_limit {
        if grant.cumulative_collected + amount > limit {
            return Err(LimitRejection::CumulativeExceeded {
                amount,
                cumulative: grant.cumulative_collected,
                limit,
            });
        }
    }
    Ok(())
}

/// Limit enforcer over a store
#[derive(Clone)]
pub struct LimitEnforcer {
    store: Arc<dyn AtcStore>,
}

impl LimitEnforcer {
    /// Create a new enforcer
    pub fn new(store: Arc<dyn AtcStore>) -> Self {
        Self { store }
    }

    /// Reserve capacity on a grant without recording a collection
    pub fn reserve(
        &self,
        grant_id: Uuid,
        amount: Decimal,
        method: CollectionMethod,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        self.reserve_with(grant_id, amount, method, now, None)
    }

    /// Reserve capacity and insert `collection` in the same atomic step
    pub fn reserve_with(
        &self,
        grant_id: Uuid,
        amount: Decimal,
        method: CollectionMethod,
        now: DateTime<Utc>,
        collection: Option<&AtcCollection>,
    ) -> Result<Reservation> {
        let guard = move |grant: &AtcGrant| check(grant, amount, method, now);
        let outcome = self.store.reserve(grant_id, amount, &guard, collection)?;

        let reservation = Reservation::from(outcome);
        match &reservation.reason {
            None => tracing::debug!(
                grant_id = %grant_id,
                amount = %amount,
                cumulative = %reservation.cumulative,
                "Capacity reserved"
            ),
            Some(reason) => tracing::warn!(
                grant_id = %grant_id,
                amount = %amount,
                reason = %reason,
                "Reserve rejected"
            ),
        }
        Ok(reservation)
    }
}
