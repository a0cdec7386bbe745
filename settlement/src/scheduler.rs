//! Settlement scheduler
//!
//! Every tick:
//!
//! 1. expire grants past their effective_to
//! 2. batch grants whose settlement period has closed (at most one batch per
//!    grant per period), and instant grants with collections the
//!    instant-settlement worker has not picked up
//! 3. initiate new batches and retry failed ones whose backoff elapsed
//! 4. fail or resolve payments the rail has not confirmed in time
//! 5. reconcile, once per reconciliation interval
//!
//! Period boundaries are midnight UTC. Weekly and biweekly periods close on
//! `settlement_day` (0 = Monday); biweekly ones on alternate weeks counted
//! from Monday 1970-01-05. Monthly periods close on day `settlement_day`
//! (1-28). Instant and on-demand grants are not scheduled.

use crate::orchestrator::SettlementOrchestrator;
use crate::reconciliation::{ReconciliationReport, Reconciler};
use crate::Result;
use atc_core::types::{BatchStatus, SettlementFrequency};
use atc_core::{AtcGrant, AtcStore, GrantRegistry};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A closed settlement period
pub type Period = (DateTime<Utc>, DateTime<Utc>);

/// The most recent period of `frequency` that has closed at `now`
pub fn closed_period(
    frequency: SettlementFrequency,
    settlement_day: u32,
    now: DateTime<Utc>,
) -> Option<Period> {
    let today = now.date_naive();
    let (start, end) = match frequency {
        SettlementFrequency::Instant | SettlementFrequency::OnDemand => return None,
        SettlementFrequency::Daily => (today - Duration::days(1), today),
        SettlementFrequency::Weekly => {
            let end = last_weekday(today, settlement_day)?;
            (end - Duration::weeks(1), end)
        }
        SettlementFrequency::Biweekly => {
            let mut end = last_weekday(today, settlement_day)?;
            if weeks_since_anchor(end) % 2 != 0 {
                end -= Duration::weeks(1);
            }
            (end - Duration::weeks(2), end)
        }
        SettlementFrequency::Monthly => {
            if !(1..=28).contains(&settlement_day) {
                return None;
            }
            let this_month = today.with_day(settlement_day)?;
            let end = if today >= this_month {
                this_month
            } else {
                this_month.checked_sub_months(Months::new(1))?
            };
            (end.checked_sub_months(Months::new(1))?, end)
        }
    };
    Some((midnight(start)?, midnight(end)?))
}

fn last_weekday(today: NaiveDate, weekday: u32) -> Option<NaiveDate> {
    if weekday > 6 {
        return None;
    }
    let back = (today.weekday().num_days_from_monday() + 7 - weekday) % 7;
    Some(today - Duration::days(i64::from(back)))
}

fn weeks_since_anchor(date: NaiveDate) -> i64 {
    // Day 1 of the CE is a Monday an even number of weeks before 1970-01-05
    (i64::from(date.num_days_from_ce()) - 1).div_euclid(7)
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n))
}

/// What one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Grants expired
    pub expired: Vec<Uuid>,
    /// Batches created for closed periods or swept from instant grants
    pub batches_created: Vec<Uuid>,
    /// New batches handed to the rail
    pub initiated: usize,
    /// Failed batches re-initiated
    pub retried: usize,
    /// Initiated payments failed or resolved for lack of confirmation
    pub timed_out: Vec<Uuid>,
    /// Reconciliation outcome, when it ran
    pub reconciliation: Option<ReconciliationReport>,
}

/// Settlement scheduler
pub struct SettlementScheduler {
    store: Arc<dyn AtcStore>,
    registry: Arc<GrantRegistry>,
    orchestrator: Arc<SettlementOrchestrator>,
    reconciler: Arc<Reconciler>,
    tick: std::time::Duration,
    reconciliation_interval: Duration,
    last_reconciliation: Mutex<Option<DateTime<Utc>>>,
}

impl SettlementScheduler {
    /// Create a scheduler
    pub fn new(
        store: Arc<dyn AtcStore>,
        registry: Arc<GrantRegistry>,
        orchestrator: Arc<SettlementOrchestrator>,
        reconciler: Arc<Reconciler>,
        tick: std::time::Duration,
        reconciliation_interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            registry,
            orchestrator,
            reconciler,
            tick,
            reconciliation_interval: Duration::from_std(reconciliation_interval)
                .unwrap_or_else(|_| Duration::days(1)),
            last_reconciliation: Mutex::new(None),
        }
    }

    /// Grants whose latest closed period has no batch yet
    pub fn due_grants(&self, now: DateTime<Utc>) -> Result<Vec<(AtcGrant, Period)>> {
        let batches = self.store.list_batches()?;
        let mut due = Vec::new();
        for grant in self.store.list_grants()? {
            let Some(period) = closed_period(
                grant.settlement.frequency,
                grant.settlement.settlement_day,
                now,
            ) else {
                continue;
            };
            let covered = batches.iter().any(|b| {
                b.grant_id == grant.id
                    && b.status != BatchStatus::Cancelled
                    && b.period_end >= period.1
            });
            if !covered {
                due.push((grant, period));
            }
        }
        Ok(due)
    }

    /// Instant grants holding eligible collections that no batch claimed,
    /// e.g. after a full hand-off queue, a worker error or a restart
    pub fn instant_backlog(&self, now: DateTime<Utc>) -> Result<Vec<AtcGrant>> {
        let mut backlog = Vec::new();
        for grant in self.store.list_grants()? {
            if grant.settlement.frequency != SettlementFrequency::Instant {
                continue;
            }
            let pending = self
                .store
                .collections_for_grant(grant.id)?
                .iter()
                .any(|c| c.is_eligible_for_batching(grant.settlement.delay_days, now));
            if pending {
                backlog.push(grant);
            }
        }
        Ok(backlog)
    }

    /// Run one tick
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            expired: self.registry.expire_due(now)?,
            ..Default::default()
        };

        for (grant, period) in self.due_grants(now)? {
            match self.orchestrator.create_batch(grant.id, Some(period), now) {
                Ok(Some(batch)) => report.batches_created.push(batch.id),
                Ok(None) => {}
                Err(e) => warn!(grant = %grant.reference, error = %e, "Scheduled batching failed"),
            }
        }

        for grant in self.instant_backlog(now)? {
            match self.orchestrator.create_batch(grant.id, None, now) {
                Ok(Some(batch)) => {
                    info!(grant = %grant.reference, batch = %batch.reference, "Swept missed instant settlement");
                    report.batches_created.push(batch.id);
                }
                Ok(None) => {}
                Err(e) => warn!(grant = %grant.reference, error = %e, "Instant sweep failed"),
            }
        }

        report.initiated = self.orchestrator.initiate_new(now).await?.len();
        report.retried = self.orchestrator.retry_due(now).await?.len();
        report.timed_out = self.orchestrator.check_timeouts(now).await?;

        let reconcile = {
            let last = self.last_reconciliation.lock();
            last.map_or(true, |at| now >= at + self.reconciliation_interval)
        };
        if reconcile {
            report.reconciliation = Some(self.reconciler.run(now).await?);
            *self.last_reconciliation.lock() = Some(now);
        }

        debug!(
            expired = report.expired.len(),
            batches = report.batches_created.len(),
            initiated = report.initiated,
            retried = report.retried,
            timed_out = report.timed_out.len(),
            "Scheduler tick"
        );
        Ok(report)
    }

    /// Tick until `shutdown` flips to true
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick.as_secs(), "Starting settlement scheduler");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        warn!("Scheduler tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Settlement scheduler stopped");
    }
}
