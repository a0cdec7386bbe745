//! Configuration for the settlement engine

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settlement engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage, currency and grant policy
    pub core: atc_core::Config,

    /// Backoff for failed payments
    pub retry: RetryPolicy,

    /// How long an initiated payment may stay unconfirmed (seconds)
    pub payment_timeout_secs: u64,

    /// Scheduler tick (seconds)
    pub scheduler_tick_secs: u64,

    /// Reconciliation run interval (seconds)
    pub reconciliation_interval_secs: u64,

    /// Buffered instant-settlement requests
    pub instant_queue_capacity: usize,

    /// Undelivered events kept per subscriber
    pub event_capacity: usize,

    /// Emit logs as JSON
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: atc_core::Config::default(),
            retry: RetryPolicy::default(),
            payment_timeout_secs: 30,
            scheduler_tick_secs: 60,
            reconciliation_interval_secs: 3600,
            instant_queue_capacity: 1024,
            event_capacity: 1024,
            log_json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.core.apply_env()?;

        if let Some(secs) = env_u64("ATC_PAYMENT_TIMEOUT_SECS")? {
            config.payment_timeout_secs = secs;
        }

        if let Some(secs) = env_u64("ATC_SCHEDULER_TICK_SECS")? {
            config.scheduler_tick_secs = secs;
        }

        if let Some(secs) = env_u64("ATC_RECONCILIATION_INTERVAL_SECS")? {
            config.reconciliation_interval_secs = secs;
        }

        if let Some(n) = env_u64("ATC_MAX_RETRIES")? {
            config.retry.max_retries = u32::try_from(n)
                .map_err(|_| crate::Error::Config(format!("ATC_MAX_RETRIES too large: {}", n)))?;
        }

        if let Ok(flag) = std::env::var("ATC_LOG_JSON") {
            config.log_json = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.scheduler_tick_secs == 0 {
            return Err(crate::Error::Config("scheduler_tick_secs must be > 0".into()));
        }
        if self.reconciliation_interval_secs == 0 {
            return Err(crate::Error::Config(
                "reconciliation_interval_secs must be > 0".into(),
            ));
        }
        if self.payment_timeout_secs == 0 {
            return Err(crate::Error::Config("payment_timeout_secs must be > 0".into()));
        }
        if self.instant_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(crate::Error::Config("queue capacities must be > 0".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(crate::Error::Config("backoff_multiplier must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(crate::Error::Config("jitter_factor must be within 0-1".into()));
        }
        Ok(())
    }

    /// Payment timeout
    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    /// Scheduler tick
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    /// Reconciliation interval
    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }
}

fn env_u64(name: &str) -> crate::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::Config(format!("{}={}: {}", name, value, e))),
        Err(_) => Ok(None),
    }
}
