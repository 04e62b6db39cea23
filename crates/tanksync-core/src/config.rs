//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::DEFAULT_MAX_BUCKETS;
use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::thresholds::ThresholdConfig;

/// Tunables for a [`SyncCoordinator`](crate::SyncCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of concurrently subscribed sensors.
    pub max_subscriptions: usize,
    /// Per-sensor bound on live readings buffered behind a gap.
    pub max_pending: usize,
    /// Capacity of each worker's live and backfill channels.
    pub channel_capacity: usize,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_ms: u64,
    /// Relative jitter applied to every backoff delay.
    pub backoff_jitter: f64,
    /// Retries per backfill page before the range is declared unresolved.
    pub backfill_max_retries: u32,
    /// Full re-fetches of a range whose pages came back incomplete.
    pub backfill_passes: u32,
    /// Maximum cached aggregate buckets.
    pub aggregate_cache_capacity: usize,
    /// Maximum buckets a single query may produce.
    pub max_buckets_per_query: usize,
    /// Events buffered per receiver before lagging.
    pub event_capacity: usize,
    /// Alert limits.
    pub thresholds: ThresholdConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 64,
            max_pending: 1024,
            channel_capacity: 256,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            backoff_jitter: 0.2,
            backfill_max_retries: 4,
            backfill_passes: 2,
            aggregate_cache_capacity: 10_000,
            max_buckets_per_query: DEFAULT_MAX_BUCKETS,
            event_capacity: 256,
            thresholds: ThresholdConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Reconnect schedule for live feeds.
    pub fn stream_policy(&self) -> BackoffPolicy {
        BackoffPolicy::for_stream()
            .initial_delay(Duration::from_millis(self.reconnect_initial_ms))
            .max_delay(Duration::from_millis(self.reconnect_max_ms))
            .jitter(self.backoff_jitter)
    }

    /// Retry schedule for backfill pages.
    pub fn backfill_policy(&self) -> BackoffPolicy {
        BackoffPolicy::for_backfill()
            .initial_delay(Duration::from_millis(self.reconnect_initial_ms))
            .max_delay(Duration::from_millis(self.reconnect_max_ms))
            .jitter(self.backoff_jitter)
            .max_retries(Some(self.backfill_max_retries))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_subscriptions == 0 {
            return Err(Error::invalid_config("max_subscriptions must be > 0"));
        }
        if self.max_pending == 0 {
            return Err(Error::invalid_config("max_pending must be > 0"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::invalid_config("channel_capacity must be > 0"));
        }
        if self.max_buckets_per_query == 0 {
            return Err(Error::invalid_config("max_buckets_per_query must be > 0"));
        }
        if self.backfill_passes == 0 {
            return Err(Error::invalid_config("backfill_passes must be > 0"));
        }
        self.stream_policy().validate()?;
        if let Some(problem) = self.thresholds.problems().into_iter().next() {
            return Err(Error::invalid_config(problem));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_policy().max_retries, None);
        assert_eq!(config.backfill_policy().max_retries, Some(4));
        assert_eq!(config.stream_policy().initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig {
            max_pending: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = SyncConfig {
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            max_buckets_per_query: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = SyncConfig {
            backoff_jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_subscriptions": 8}"#).unwrap();
        assert_eq!(config.max_subscriptions, 8);
        assert_eq!(config.max_pending, 1024);
    }
}
