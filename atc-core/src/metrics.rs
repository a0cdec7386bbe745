//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `atc_grants_created_total` - Grants created
//! - `atc_grant_transitions_total{to}` - Grant status changes
//! - `atc_collections_total` - Collections recorded
//! - `atc_collection_rejections_total{reason}` - Collections refused
//! - `atc_collected_amount` - Histogram of gross amounts
//! - `atc_batches_total{status}` - Batch state changes
//! - `atc_payment_attempts_total` - Rail initiation attempts
//! - `atc_discrepancies_total{kind}` - Reconciliation discrepancies

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Grants created
    pub grants_created: IntCounter,

    /// Grant transitions by target status
    pub grant_transitions: IntCounterVec,

    /// Collections recorded
    pub collections_total: IntCounter,

    /// Collection rejections by reason
    pub collection_rejections: IntCounterVec,

    /// Gross amount histogram
    pub collected_amount: Histogram,

    /// Batch transitions by status
    pub batches: IntCounterVec,

    /// Rail initiation attempts
    pub payment_attempts: IntCounter,

    /// Discrepancies by kind
    pub discrepancies: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector on a private registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let grants_created = IntCounter::new("atc_grants_created_total", "Grants created")?;
        registry.register(Box::new(grants_created.clone()))?;

        let grant_transitions = IntCounterVec::new(
            Opts::new("atc_grant_transitions_total", "Grant status changes"),
            &["to"],
        )?;
        registry.register(Box::new(grant_transitions.clone()))?;

        let collections_total =
            IntCounter::new("atc_collections_total", "Collections recorded")?;
        registry.register(Box::new(collections_total.clone()))?;

        let collection_rejections = IntCounterVec::new(
            Opts::new("atc_collection_rejections_total", "Collections refused"),
            &["reason"],
        )?;
        registry.register(Box::new(collection_rejections.clone()))?;

        let collected_amount = Histogram::with_opts(
            HistogramOpts::new("atc_collected_amount", "Histogram of gross amounts").buckets(
                vec![100.0, 1_000.0, 10_000.0, 50_000.0, 100_000.0, 500_000.0, 1_000_000.0],
            ),
        )?;
        registry.register(Box::new(collected_amount.clone()))?;

        let batches = IntCounterVec::new(
            Opts::new("atc_batches_total", "Batch state changes"),
            &["status"],
        )?;
        registry.register(Box::new(batches.clone()))?;

        let payment_attempts =
            IntCounter::new("atc_payment_attempts_total", "Rail initiation attempts")?;
        registry.register(Box::new(payment_attempts.clone()))?;

        let discrepancies = IntCounterVec::new(
            Opts::new("atc_discrepancies_total", "Reconciliation discrepancies"),
            &["kind"],
        )?;
        registry.register(Box::new(discrepancies.clone()))?;

        Ok(Self {
            grants_created,
            grant_transitions,
            collections_total,
            collection_rejections,
            collected_amount,
            batches,
            payment_attempts,
            discrepancies,
            registry,
        })
    }

    /// Record grant creation
    pub fn record_grant_created(&self) {
        self.grants_created.inc();
    }

    /// Record a grant status change
    pub fn record_grant_transition(&self, to: &str) {
        self.grant_transitions.with_label_values(&[to]).inc();
    }

    /// Record a collection
    pub fn record_collection(&self, gross: f64) {
        self.collections_total.inc();
        self.collected_amount.observe(gross);
    }

    /// Record a refused collection
    pub fn record_rejection(&self, reason: &str) {
        self.collection_rejections.with_label_values(&[reason]).inc();
    }

    /// Record a batch state change
    pub fn record_batch(&self, status: &str) {
        self.batches.with_label_values(&[status]).inc();
    }

    /// Record a rail attempt
    pub fn record_payment_attempt(&self) {
        self.payment_attempts.inc();
    }

    /// Record a discrepancy
    pub fn record_discrepancy(&self, kind: &str) {
        self.discrepancies.with_label_values(&[kind]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
