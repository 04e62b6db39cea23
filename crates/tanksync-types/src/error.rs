//! Error types for value parsing and validation in tanksync-types.

use thiserror::Error;

/// Errors that can occur when constructing or parsing telemetry values.
///
/// This error type is platform-agnostic and does not include
/// network or storage errors (those belong in tanksync-core and tanksync-store).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Generic invalid input.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A time range whose end precedes its start.
    #[error("Invalid time range: end {end} precedes start {start}")]
    InvalidTimeRange {
        /// Start of the range (unix milliseconds).
        start: i64,
        /// End of the range (unix milliseconds).
        end: i64,
    },

    /// A sequence range whose last sequence precedes its first.
    #[error("Invalid sequence range: {last} precedes {first}")]
    InvalidSequenceRange {
        /// First sequence.
        first: u64,
        /// Last sequence.
        last: u64,
    },

    /// Metric name that is not recognised.
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    /// Date filter name that is not recognised.
    #[error("Unknown date filter: {0}")]
    UnknownDateFilter(String),
}

/// Result type alias using tanksync-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
