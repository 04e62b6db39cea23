//! Platform-agnostic types for aquarium sensor telemetry.
//!
//! This crate provides the value types shared by the store, the sync engine
//! and any display layer that consumes aggregated series.
//!
//! # Features
//!
//! - [`Reading`]: one immutable measurement identified by sensor and sequence
//! - [`Timestamp`] and [`TimeRange`]: millisecond instants and half-open ranges
//! - [`SequenceRange`]: inclusive backend sequence ranges used for backfill
//! - [`AggregateBucket`]: per-bucket count/min/max/sum with derived average
//! - [`ConnectionState`]: subscription state reported to the display layer
//! - [`Metric`] and [`DateFilter`]: aquarium metrics and chart presets
//!
//! # Example
//!
//! ```
//! use tanksync_types::{Reading, TimeRange, Timestamp};
//!
//! let reading = Reading::new("tank-1/temperature", 42, Timestamp::from_millis(1_000), 25.4);
//! let window = TimeRange::from_millis(0, 60_000).unwrap();
//! assert!(window.contains(reading.timestamp));
//! ```

pub mod error;
pub mod metric;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use metric::{DateFilter, Metric};
pub use types::{
    AggregateBucket, ConnectionState, Reading, SequenceRange, TimeRange, Timestamp,
    duration_millis,
};
