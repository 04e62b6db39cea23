//! Aquarium metrics and display presets.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::{TimeRange, Timestamp};

/// The quantity a sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Metric {
    /// Water temperature in degrees Celsius.
    Temperature,
    /// Acidity (pH).
    Ph,
    /// Dissolved oxygen in mg/L.
    Oxygen,
    /// Water level as a percentage of tank capacity.
    WaterLevel,
}

impl Metric {
    /// All known metrics.
    pub const ALL: [Metric; 4] = [
        Metric::Temperature,
        Metric::Ph,
        Metric::Oxygen,
        Metric::WaterLevel,
    ];

    /// Human-readable label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Ph => "pH Level",
            Metric::Oxygen => "Oxygen Level",
            Metric::WaterLevel => "Water Level",
        }
    }

    /// Display unit.
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Ph => "",
            Metric::Oxygen => "mg/L",
            Metric::WaterLevel => "%",
        }
    }

    /// Identifier used in configuration and URLs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Ph => "ph",
            Metric::Oxygen => "oxygen",
            Metric::WaterLevel => "water_level",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Metric {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "temperature" | "temp" => Ok(Metric::Temperature),
            "ph" => Ok(Metric::Ph),
            "oxygen" | "o2" => Ok(Metric::Oxygen),
            "water_level" | "level" => Ok(Metric::WaterLevel),
            _ => Err(ParseError::UnknownMetric(s.to_string())),
        }
    }
}

/// Preset display ranges for charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DateFilter {
    /// The last 24 hours.
    #[default]
    Last24Hours,
    /// The last 7 days.
    LastWeek,
    /// The last 30 days.
    LastMonth,
    /// Everything since the epoch.
    AllTime,
}

impl DateFilter {
    /// Length of the window in hours, `None` for [`DateFilter::AllTime`].
    #[must_use]
    pub fn hours(&self) -> Option<u64> {
        match self {
            DateFilter::Last24Hours => Some(24),
            DateFilter::LastWeek => Some(24 * 7),
            DateFilter::LastMonth => Some(24 * 30),
            DateFilter::AllTime => None,
        }
    }

    /// Resolve to a concrete range ending at `now` (inclusive).
    #[must_use]
    pub fn range(&self, now: Timestamp) -> TimeRange {
        match self.hours() {
            Some(hours) => TimeRange::last(Duration::from_secs(hours * 3600), now),
            None => TimeRange {
                start: Timestamp::EPOCH,
                end: now.next(),
            },
        }
    }

    /// Resolve to whole `width_ms` buckets, ending at the start of the
    /// bucket containing `now`.
    #[must_use]
    pub fn bucketed_range(&self, now: Timestamp, width_ms: i64) -> TimeRange {
        let end = now.align_down(width_ms.max(1));
        let start = match self.hours() {
            Some(hours) => end.saturating_sub_millis(hours as i64 * 3_600_000),
            None => Timestamp::EPOCH,
        };
        TimeRange {
            start: start.min(end),
            end,
        }
    }
}

impl FromStr for DateFilter {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "last_24_hours" | "24h" | "day" => Ok(DateFilter::Last24Hours),
            "last_week" | "7d" | "week" => Ok(DateFilter::LastWeek),
            "last_month" | "30d" | "month" => Ok(DateFilter::LastMonth),
            "all_time" | "all" => Ok(DateFilter::AllTime),
            _ => Err(ParseError::UnknownDateFilter(s.to_string())),
        }
    }
}

impl fmt::Display for DateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateFilter::Last24Hours => write!(f, "Last 24 hours"),
            DateFilter::LastWeek => write!(f, "Last week"),
            DateFilter::LastMonth => write!(f, "Last month"),
            DateFilter::AllTime => write!(f, "All time"),
        }
    }
}
