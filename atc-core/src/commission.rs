//! Commission calculation
//!
//! Pure and deterministic: the same terms and gross always give the same split.
//! Intermediate values keep full precision; rounding happens exactly once, at
//! the end, with banker's rounding to the currency's minor unit.

use crate::types::{CommissionKind, CommissionTerms, CommissionTier};
use crate::{Error, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// How a gross amount splits between grantee and grantor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    /// Kept by the grantee
    pub commission: Decimal,
    /// Owed to the grantor
    pub net: Decimal,
    /// Commission was capped at gross
    pub capped_at_gross: bool,
}

/// Commission calculator for one currency
#[derive(Debug, Clone, Copy)]
pub struct CommissionCalculator {
    minor_units: u32,
}

impl CommissionCalculator {
    /// Calculator rounding to `minor_units` decimal places
    pub fn new(minor_units: u32) -> Self {
        Self { minor_units }
    }

    /// Split `gross` according to `terms`
    pub fn calculate(&self, terms: &CommissionTerms, gross: Decimal) -> Result<CommissionSplit> {
        if gross.is_sign_negative() {
            return Err(Error::Validation(format!(
                "gross amount must not be negative, got {}",
                gross
            )));
        }

        let hundred = Decimal::ONE_HUNDRED;
        let mut raw = match terms.kind {
            CommissionKind::Percentage => gross * terms.rate / hundred,
            CommissionKind::Flat => terms.flat_amount,
            CommissionKind::Tiered => {
                let tier = select_tier(&terms.tiers, gross)?;
                gross * tier.rate / hundred
            }
            CommissionKind::Hybrid => terms.flat_amount + gross * terms.rate / hundred,
        };

        if let Some(min) = terms.min_commission {
            raw = raw.max(min);
        }
        if let Some(max) = terms.max_commission {
            raw = raw.min(max);
        }

        let capped_at_gross = raw > gross;
        if capped_at_gross {
            tracing::warn!(
                commission = %raw,
                gross = %gross,
                kind = ?terms.kind,
                "Commission exceeds gross, capping"
            );
            raw = gross;
        }

        let commission =
            raw.round_dp_with_strategy(self.minor_units, RoundingStrategy::MidpointNearestEven);

        Ok(CommissionSplit {
            commission,
            net: gross - commission,
            capped_at_gross,
        })
    }
}

/// First tier whose bounds contain `gross`
pub fn select_tier(tiers: &[CommissionTier], gross: Decimal) -> Result<&CommissionTier> {
    tiers
        .iter()
        .find(|t| t.contains(gross))
        .ok_or_else(|| Error::NoMatchingTier(gross.to_string()))
}

/// Check commission terms at grant creation
pub fn validate_terms(terms: &CommissionTerms) -> Result<()> {
    let invalid = |msg: String| Err(Error::Validation(msg));

    let rate_ok = |r: Decimal| r >= Decimal::ZERO && r <= Decimal::ONE_HUNDRED;
    if !rate_ok(terms.rate) {
        return invalid(format!("commission rate must be 0-100, got {}", terms.rate));
    }
    if terms.flat_amount.is_sign_negative() {
        return invalid(format!(
            "flat commission must not be negative, got {}",
            terms.flat_amount
        ));
    }
    if terms.min_commission.is_some_and(|m| m.is_sign_negative())
        || terms.max_commission.is_some_and(|m| m.is_sign_negative())
    {
        return invalid("commission bounds must not be negative".to_string());
    }
    if let (Some(min), Some(max)) = (terms.min_commission, terms.max_commission) {
        if min > max {
            return invalid(format!("min commission {} exceeds max {}", min, max));
        }
    }

    if terms.kind == CommissionKind::Tiered {
        validate_tiers(&terms.tiers)?;
    }
    Ok(())
}

fn validate_tiers(tiers: &[CommissionTier]) -> Result<()> {
    if tiers.is_empty() {
        return Err(Error::Validation(
            "tiered commission needs at least one tier".to_string(),
        ));
    }

    for (i, tier) in tiers.iter().enumerate() {
        if tier.rate < Decimal::ZERO || tier.rate > Decimal::ONE_HUNDRED {
            return Err(Error::Validation(format!(
                "tier {} rate must be 0-100, got {}",
                i, tier.rate
            )));
        }
        if tier.min_amount.is_sign_negative() {
            return Err(Error::Validation(format!("tier {} has a negative minimum", i)));
        }

        let is_last = i + 1 == tiers.len();
        match (tier.max_amount, is_last) {
            (None, false) => {
                return Err(Error::Validation(format!(
                    "only the last tier may be open-ended (tier {})",
                    i
                )));
            }
            (Some(max), _) if max <= tier.min_amount => {
                return Err(Error::Validation(format!(
                    "tier {} max {} must exceed min {}",
                    i, max, tier.min_amount
                )));
            }
            (Some(max), false) => {
                let next = &tiers[i + 1];
                if next.min_amount != max {
                    return Err(Error::Validation(format!(
                        "tiers must be contiguous: tier {} ends at {} but tier {} starts at {}",
                        i,
                        max,
                        i + 1,
                        next.min_amount
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
