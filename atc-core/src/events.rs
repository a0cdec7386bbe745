//! Domain events and the in-process event bus

use crate::types::{DiscrepancyKind, GrantStatus, PartyId, SettlementBatch};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum AtcEvent {
    /// Grant created
    GrantCreated {
        grant_id: Uuid,
        grantor_id: PartyId,
        grantee_id: PartyId,
        status: GrantStatus,
    },

    /// Grant approved and active
    GrantApproved { grant_id: Uuid, approved_by: PartyId },

    /// Grant suspended
    GrantSuspended { grant_id: Uuid, reason: String },

    /// Suspended grant reactivated
    GrantReinstated { grant_id: Uuid },

    /// Grant revoked
    GrantRevoked { grant_id: Uuid, reason: String },

    /// Grant reached effective_to
    GrantExpired { grant_id: Uuid },

    /// Collection recorded
    CollectionRecorded {
        collection_id: Uuid,
        grant_id: Uuid,
        gross: Decimal,
        commission: Decimal,
        net: Decimal,
    },

    /// Unsettled collections flagged after revocation
    CollectionsFlagged { grant_id: Uuid, count: usize },

    /// Batch created
    BatchCreated {
        batch_id: Uuid,
        grant_id: Uuid,
        total_net: Decimal,
        transaction_count: u32,
    },

    /// Payment handed to the rail
    PaymentInitiated {
        batch_id: Uuid,
        rail_reference: String,
        attempt: u32,
    },

    /// Grantor paid
    SettlementCompleted {
        batch_id: Uuid,
        grant_id: Uuid,
        total_net: Decimal,
        settled_at: DateTime<Utc>,
    },

    /// Payment failed
    PaymentFailed {
        batch_id: Uuid,
        reason: String,
        attempt: u32,
        next_retry_at: Option<DateTime<Utc>>,
    },

    /// Collections escalated for review
    CollectionDisputed {
        batch_id: Uuid,
        collection_ids: Vec<Uuid>,
    },

    /// Batch cancelled, collections released
    BatchCancelled { batch_id: Uuid, reason: String },

    /// Batch as stored after any change
    BatchUpdated { batch: Box<SettlementBatch> },

    /// Reconciliation found a mismatch
    DiscrepancyRaised {
        discrepancy_id: Uuid,
        kind: DiscrepancyKind,
        subject_id: Uuid,
        difference: Decimal,
    },
}

impl AtcEvent {
    /// JSON payload for downstream consumers
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast bus; slow subscribers miss events rather than block the engine
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AtcEvent>,
}

impl EventBus {
    /// Bus with room for `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event
    pub fn emit(&self, event: AtcEvent) {
        debug!(event = ?event, "ATC event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AtcEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
