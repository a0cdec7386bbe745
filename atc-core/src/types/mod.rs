//! Core types for the ATC engine
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, never floats)
//! - Explicit state machines (status enums carry their transition tables)

pub mod batch;
pub mod collection;
pub mod grant;

pub use batch::*;
pub use collection::*;
pub use grant::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque party identifier (manufacturer, distributor, agent, retailer...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId(Uuid);

impl PartyId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh random party ID
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a party in the distribution chain.
///
/// Metadata only: no control flow depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartyType {
    /// Manufacturer
    Manufacturer,
    /// Distributor
    Distributor,
    /// Wholesaler
    Wholesaler,
    /// Retailer
    Retailer,
    /// Van-sales agent or field worker
    Worker,
    /// Platform operator
    Platform,
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Kenyan Shilling
    KES,
    /// Nigerian Naira
    NGN,
    /// Ugandan Shilling
    UGX,
    /// Tanzanian Shilling
    TZS,
    /// Ghanaian Cedi
    GHS,
    /// West African CFA Franc
    XOF,
    /// South African Rand
    ZAR,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::KES => "KES",
            Currency::NGN => "NGN",
            Currency::UGX => "UGX",
            Currency::TZS => "TZS",
            Currency::GHS => "GHS",
            Currency::XOF => "XOF",
            Currency::ZAR => "ZAR",
        }
    }

    /// Parse from ISO code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "KES" => Some(Currency::KES),
            "NGN" => Some(Currency::NGN),
            "UGX" => Some(Currency::UGX),
            "TZS" => Some(Currency::TZS),
            "GHS" => Some(Currency::GHS),
            "XOF" => Some(Currency::XOF),
            "ZAR" => Some(Currency::ZAR),
            _ => None,
        }
    }

    /// Number of decimal places in the minor unit
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::UGX | Currency::XOF => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Short human-readable reference: prefix plus the first 8 hex chars of a UUID
pub(crate) fn short_reference(prefix: &str, id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("{}{}", prefix, simple[..8].to_uppercase())
}
