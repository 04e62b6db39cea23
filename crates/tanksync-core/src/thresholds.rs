//! Per-metric alert limits and do-not-disturb hours.
//!
//! # Example
//!
//! ```
//! use tanksync_core::{Level, Thresholds};
//! use tanksync_types::Metric;
//!
//! let thresholds = Thresholds::default();
//! assert_eq!(thresholds.evaluate(Metric::Ph, 7.0), Level::Normal);
//! assert_eq!(thresholds.evaluate(Metric::Temperature, 29.5), Level::High);
//! ```

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use tanksync_types::{Metric, Timestamp};

/// Where a value falls relative to its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Below the minimum.
    Low,
    /// Within limits.
    Normal,
    /// Above the maximum.
    High,
}

impl Level {
    /// Whether this level warrants an alert.
    pub fn is_alert(&self) -> bool {
        !matches!(self, Level::Normal)
    }
}

/// Inclusive bounds for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricLimits {
    pub min: f64,
    pub max: f64,
}

impl MetricLimits {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Classify `value`.
    pub fn level(&self, value: f64) -> Level {
        if value < self.min {
            Level::Low
        } else if value > self.max {
            Level::High
        } else {
            Level::Normal
        }
    }
}

/// Hours of the tank's local day (0-23) during which alerts are not
/// notified.
///
/// `start > end` wraps past midnight, e.g. 22 to 7. Local time is UTC
/// shifted by `utc_offset_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHours {
    pub enabled: bool,
    pub start_hour: u8,
    pub end_hour: u8,
    /// Offset of local time from UTC, e.g. `-300` for UTC-5.
    pub utc_offset_minutes: i16,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 22,
            end_hour: 7,
            utc_offset_minutes: 0,
        }
    }
}

impl QuietHours {
    /// Largest accepted offset from UTC, in minutes.
    pub const MAX_OFFSET_MINUTES: i16 = 14 * 60;

    /// Local hour of day at `ts`.
    pub fn local_hour(&self, ts: Timestamp) -> u8 {
        let secs = ts.as_millis().div_euclid(1_000) + i64::from(self.utc_offset_minutes) * 60;
        OffsetDateTime::from_unix_timestamp(secs)
            .map(|dt| dt.hour())
            .unwrap_or(0)
    }

    /// Whether `hour` falls in the quiet period.
    pub fn contains(&self, hour: u8) -> bool {
        if !self.enabled || self.start_hour == self.end_hour {
            return false;
        }
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Alert limits for every metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub temperature: MetricLimits,
    pub ph: MetricLimits,
    pub oxygen: MetricLimits,
    pub water_level: MetricLimits,
    pub quiet_hours: QuietHours,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            temperature: MetricLimits::new(22.0, 28.0),
            ph: MetricLimits::new(6.5, 7.5),
            oxygen: MetricLimits::new(5.0, 12.0),
            water_level: MetricLimits::new(80.0, 100.0),
            quiet_hours: QuietHours::default(),
        }
    }
}

impl ThresholdConfig {
    /// Limits for `metric`.
    pub fn limits(&self, metric: Metric) -> MetricLimits {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Ph => self.ph,
            Metric::Oxygen => self.oxygen,
            Metric::WaterLevel => self.water_level,
            _ => MetricLimits::new(f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    /// Messages for limits that are inverted, non-finite, or hours out of range.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for metric in Metric::ALL {
            let limits = self.limits(metric);
            if !limits.min.is_finite() || !limits.max.is_finite() {
                problems.push(format!("{} limits must be finite", metric.as_str()));
            } else if limits.min > limits.max {
                problems.push(format!(
                    "{} min ({}) exceeds max ({})",
                    metric.as_str(),
                    limits.min,
                    limits.max
                ));
            }
        }
        if self.quiet_hours.start_hour > 23 || self.quiet_hours.end_hour > 23 {
            problems.push("quiet hours must be between 0 and 23".to_string());
        }
        let offset = self.quiet_hours.utc_offset_minutes.unsigned_abs();
        if offset > QuietHours::MAX_OFFSET_MINUTES.unsigned_abs() {
            problems.push(format!(
                "quiet hours UTC offset must be within ±{} minutes",
                QuietHours::MAX_OFFSET_MINUTES
            ));
        }
        problems
    }
}

/// Threshold evaluator for sensor readings.
#[derive(Debug, Clone, Default)]
pub struct Thresholds {
    config: ThresholdConfig,
}

impl Thresholds {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    /// Classify a value of `metric`.
    pub fn evaluate(&self, metric: Metric, value: f64) -> Level {
        self.config.limits(metric).level(value)
    }

    /// Whether `ts` falls within do-not-disturb hours.
    pub fn is_quiet(&self, ts: Timestamp) -> bool {
        let quiet = &self.config.quiet_hours;
        quiet.contains(quiet.local_hour(ts))
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let t = Thresholds::default();
        assert_eq!(t.evaluate(Metric::Temperature, 21.9), Level::Low);
        assert_eq!(t.evaluate(Metric::Temperature, 22.0), Level::Normal);
        assert_eq!(t.evaluate(Metric::Temperature, 28.0), Level::Normal);
        assert_eq!(t.evaluate(Metric::Ph, 7.6), Level::High);
        assert_eq!(t.evaluate(Metric::Oxygen, 4.0), Level::Low);
        assert_eq!(t.evaluate(Metric::WaterLevel, 90.0), Level::Normal);
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let quiet = QuietHours::default();
        assert!(quiet.contains(22));
        assert!(quiet.contains(23));
        assert!(quiet.contains(0));
        assert!(quiet.contains(6));
        assert!(!quiet.contains(7));
        assert!(!quiet.contains(12));
    }

    #[test]
    fn test_quiet_hours_same_day_and_disabled() {
        let quiet = QuietHours {
            enabled: true,
            start_hour: 9,
            end_hour: 17,
            utc_offset_minutes: 0,
        };
        assert!(quiet.contains(9));
        assert!(!quiet.contains(17));

        let off = QuietHours {
            enabled: false,
            ..QuietHours::default()
        };
        assert!(!off.contains(23));
    }

    #[test]
    fn test_is_quiet_defaults_to_utc_hour() {
        let t = Thresholds::default();
        // 1970-01-01T23:00:00Z
        assert!(t.is_quiet(Timestamp::from_millis(23 * 3_600_000)));
        // 1970-01-01T12:00:00Z
        assert!(!t.is_quiet(Timestamp::from_millis(12 * 3_600_000)));
    }

    #[test]
    fn test_is_quiet_uses_local_hour() {
        let hour = 3_600_000;
        let mut config = ThresholdConfig::default();
        // UTC-5: 03:00Z is 22:00 local, 12:00Z is 07:00 local
        config.quiet_hours.utc_offset_minutes = -300;
        let t = Thresholds::new(config);
        assert_eq!(t.config().quiet_hours.local_hour(Timestamp::from_millis(27 * hour)), 22);
        assert!(t.is_quiet(Timestamp::from_millis(27 * hour)));
        assert!(!t.is_quiet(Timestamp::from_millis(36 * hour)));
        // 23:00Z is 18:00 local
        assert!(!t.is_quiet(Timestamp::from_millis(23 * hour)));

        let mut config = ThresholdConfig::default();
        // UTC+5:30: 17:00Z is 22:30 local
        config.quiet_hours.utc_offset_minutes = 330;
        let t = Thresholds::new(config);
        assert!(t.is_quiet(Timestamp::from_millis(17 * hour)));
        assert!(!t.is_quiet(Timestamp::from_millis(16 * hour)));
    }

    #[test]
    fn test_problems() {
        assert!(ThresholdConfig::default().problems().is_empty());

        let mut config = ThresholdConfig::default();
        config.ph = MetricLimits::new(8.0, 6.0);
        config.quiet_hours.end_hour = 24;
        config.quiet_hours.utc_offset_minutes = 15 * 60;
        assert_eq!(config.problems().len(), 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ThresholdConfig = serde_json::from_str(r#"{"ph": {"min": 6.0, "max": 8.0}}"#).unwrap();
        assert_eq!(config.ph, MetricLimits::new(6.0, 8.0));
        assert_eq!(config.temperature, MetricLimits::new(22.0, 28.0));
    }
}
