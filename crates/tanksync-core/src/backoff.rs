//! Exponential backoff for reconnects and backfill retries.
//!
//! [`BackoffPolicy`] is a pure description of the delay schedule;
//! [`Backoff`] is the small state machine that walks it. Jitter is passed in
//! as a sample so the schedule can be tested without randomness.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tanksync_core::BackoffPolicy;
//!
//! let policy = BackoffPolicy::default();
//! // attempt 0 with no jitter: the initial delay
//! assert_eq!(policy.delay_for_attempt(0, 0.0), Duration::from_secs(1));
//! // the schedule doubles and caps at 30 s
//! assert_eq!(policy.delay_for_attempt(10, 0.0), Duration::from_secs(30));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Delay schedule for retrying a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Relative jitter; `0.2` spreads delays by ±20 %.
    pub jitter: f64,
    /// Retry ceiling, `None` for unlimited.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    /// Schedule for live-feed reconnects: retries forever.
    pub fn for_stream() -> Self {
        Self::default()
    }

    /// Schedule for backfill requests: gives up after a few attempts so a
    /// lost range escalates instead of stalling the sensor.
    pub fn for_backfill() -> Self {
        Self {
            max_retries: Some(4),
            ..Self::default()
        }
    }

    /// Set the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the relative jitter.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the retry ceiling.
    #[must_use]
    pub fn max_retries(mut self, retries: Option<u32>) -> Self {
        self.max_retries = retries;
        self
    }

    /// Delay for `attempt` before jitter: `initial * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay for `attempt` with jitter applied.
    ///
    /// `jitter_sample` is clamped to `[-1.0, 1.0]`; `-1.0` yields the
    /// shortest delay, `1.0` the longest.
    pub fn delay_for_attempt(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let factor = 1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0);
        Duration::try_from_secs_f64((base * factor).max(0.0)).unwrap_or(self.max_delay)
    }

    /// Delay for `attempt` with a random jitter sample.
    pub fn random_delay(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_for_attempt(attempt, sample)
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(Error::invalid_config("backoff multiplier must be >= 1.0"));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::invalid_config("backoff initial delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config(
                "backoff max delay must be >= initial delay",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::invalid_config("backoff jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Attempt counter walking a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries
            && self.attempt >= max
        {
            return None;
        }
        let delay = self.policy.random_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to attempt zero, after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The underlying policy.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

/// Run `operation`, retrying retryable errors according to `policy`.
///
/// Non-retryable errors are returned immediately. Cancelling `cancel`
/// interrupts a pending backoff sleep and returns [`Error::Cancelled`].
pub async fn with_retry<F, Fut, T>(
    policy: &BackoffPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy.clone());

    loop {
        let err = match operation().await {
            Ok(value) => {
                if backoff.attempt() > 0 {
                    debug!("{} succeeded after {} retries", operation_name, backoff.attempt());
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        let Some(delay) = backoff.next_delay() else {
            return Err(err);
        };
        warn!(
            "{} failed (attempt {}), retrying in {:?}: {}",
            operation_name,
            backoff.attempt(),
            delay,
            err
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(delay) => {}
        }
    }
}
