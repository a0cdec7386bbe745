//! Payment rail interface
//!
//! The engine pays grantors through an external rail (bank transfer,
//! mobile-money disbursement). Connectors live outside this crate; they
//! implement [`PaymentRail`]. Every instruction carries the batch's stable
//! idempotency key, and a rail must answer a repeated key with the payment it
//! already created.

use crate::{Error, Result};
use async_trait::async_trait;
use atc_core::types::PaymentStatus;
use atc_core::Currency;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// A payment to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    /// Stable per batch
    pub idempotency_key: String,
    /// Rail-specific destination (`bank:account` or `provider:phone`)
    pub destination: String,
    /// Amount to pay
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
}

/// Rail answer to an initiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailReceipt {
    /// Reference assigned by the rail
    pub rail_reference: String,
    /// Status at the time of the answer
    pub status: PaymentStatus,
}

/// What the rail recorded for a payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailPaymentRecord {
    /// Reference assigned by the rail
    pub rail_reference: String,
    /// Current status
    pub status: PaymentStatus,
    /// Amount the rail actually moved
    pub amount: Decimal,
    /// Completion time, if complete
    pub completed_at: Option<DateTime<Utc>>,
}

/// External payment rail
#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Send a payment. A repeated idempotency key returns the original receipt.
    async fn initiate_payment(&self, instruction: &PaymentInstruction) -> Result<RailReceipt>;

    /// Look up a payment for reconciliation
    async fn lookup_payment(&self, rail_reference: &str) -> Result<RailPaymentRecord>;
}

#[derive(Debug, Clone)]
struct MockPayment {
    instruction: PaymentInstruction,
    receipt: RailReceipt,
    recorded_amount: Decimal,
    completed_at: Option<DateTime<Utc>>,
}

/// In-process rail for tests and local runs
pub struct MockPaymentRail {
    latency_ms: u64,
    success_rate: f64,
    settle_immediately: bool,
    by_key: DashMap<String, String>,
    payments: DashMap<String, MockPayment>,
    scripted_failures: Mutex<VecDeque<String>>,
    calls: AtomicU32,
}

impl MockPaymentRail {
    /// Rail that accepts everything and leaves payments processing
    pub fn new() -> Self {
        Self {
            latency_ms: 0,
            success_rate: 1.0,
            settle_immediately: false,
            by_key: DashMap::new(),
            payments: DashMap::new(),
            scripted_failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Simulated network latency
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Randomly fail initiations
    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self
    }

    /// Report payments as settled in the initiation receipt
    pub fn settling_immediately(mut self) -> Self {
        self.settle_immediately = true;
        self
    }

    /// Fail the next initiation with `reason`
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.scripted_failures.lock().push_back(reason.into());
    }

    /// Initiation calls received, including repeats
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct payments created
    pub fn payment_count(&self) -> usize {
        self.payments.len()
    }

    /// Payment created for an idempotency key
    pub fn reference_for(&self, idempotency_key: &str) -> Option<String> {
        self.by_key.get(idempotency_key).map(|r| r.clone())
    }

    /// Mark a payment complete, as the rail would before its callback
    pub fn complete(&self, rail_reference: &str, status: PaymentStatus) -> Result<()> {
        let mut payment = self
            .payments
            .get_mut(rail_reference)
            .ok_or_else(|| Error::Rail(format!("Payment not found: {}", rail_reference)))?;
        payment.receipt.status = status;
        if status.is_final() {
            payment.completed_at = Some(Utc::now());
        }
        info!(rail_reference = %rail_reference, status = ?status, "Mock payment updated");
        Ok(())
    }

    /// Make the rail report a different amount than it was asked to pay
    pub fn record_amount(&self, rail_reference: &str, amount: Decimal) -> Result<()> {
        let mut payment = self
            .payments
            .get_mut(rail_reference)
            .ok_or_else(|| Error::Rail(format!("Payment not found: {}", rail_reference)))?;
        payment.recorded_amount = amount;
        Ok(())
    }

    /// Instruction received for a payment
    pub fn instruction(&self, rail_reference: &str) -> Option<PaymentInstruction> {
        self.payments
            .get(rail_reference)
            .map(|p| p.instruction.clone())
    }

    fn should_succeed(&self) -> bool {
        let mut rng = rand::thread_rng();
        self.success_rate >= 1.0 || rng.gen::<f64>() < self.success_rate
    }
}

impl Default for MockPaymentRail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentRail for MockPaymentRail {
    async fn initiate_payment(&self, instruction: &PaymentInstruction) -> Result<RailReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }

        if let Some(rail_reference) = self.reference_for(&instruction.idempotency_key) {
            if let Some(payment) = self.payments.get(&rail_reference) {
                info!(
                    idempotency_key = %instruction.idempotency_key,
                    rail_reference = %rail_reference,
                    "Mock rail: repeated key, returning original payment"
                );
                return Ok(payment.receipt.clone());
            }
        }

        if let Some(reason) = self.scripted_failures.lock().pop_front() {
            warn!(reason = %reason, "Mock rail: scripted failure");
            return Err(Error::Rail(reason));
        }

        if !self.should_succeed() {
            warn!("Mock rail: simulated failure");
            return Err(Error::Rail("Simulated rail failure".to_string()));
        }

        let status = if self.settle_immediately {
            PaymentStatus::Settled
        } else {
            PaymentStatus::Processing
        };
        let receipt = RailReceipt {
            rail_reference: format!("MOCK-{}", Uuid::new_v4()),
            status,
        };

        // The key slot stays locked until the payment exists, so a concurrent
        // repeat sees either nothing or the finished payment
        match self.by_key.entry(instruction.idempotency_key.clone()) {
            Entry::Occupied(existing) => {
                let reference = existing.get().clone();
                drop(existing);
                return self
                    .payments
                    .get(&reference)
                    .map(|p| p.receipt.clone())
                    .ok_or_else(|| Error::Rail(format!("Payment not found: {}", reference)));
            }
            Entry::Vacant(slot) => {
                self.payments.insert(
                    receipt.rail_reference.clone(),
                    MockPayment {
                        instruction: instruction.clone(),
                        receipt: receipt.clone(),
                        recorded_amount: instruction.amount,
                        completed_at: self.settle_immediately.then(Utc::now),
                    },
                );
                slot.insert(receipt.rail_reference.clone());
            }
        }

        info!(
            amount = %instruction.amount,
            currency = %instruction.currency.code(),
            destination = %instruction.destination,
            rail_reference = %receipt.rail_reference,
            "Mock rail: payment initiated"
        );
        Ok(receipt)
    }

    async fn lookup_payment(&self, rail_reference: &str) -> Result<RailPaymentRecord> {
        let payment = self
            .payments
            .get(rail_reference)
            .ok_or_else(|| Error::Rail(format!("Payment not found: {}", rail_reference)))?;
        Ok(RailPaymentRecord {
            rail_reference: rail_reference.to_string(),
            status: payment.receipt.status,
            amount: payment.recorded_amount,
            completed_at: payment.completed_at,
        })
    }
}
