//! Telemetry synchronization engine for aquarium sensors.
//!
//! This crate merges a live push feed with a paginated history backend into
//! one gapless, deduplicated timeline per sensor, and serves cached
//! aggregates over it.
//!
//! # Features
//!
//! - **Live subscriptions**: reconnecting feed subscriber with jittered
//!   exponential backoff
//! - **Gap repair**: out-of-order events are buffered while missing sequences
//!   are backfilled, then applied strictly in sequence order
//! - **Coverage tracking**: queries refuse ranges not known to be complete
//! - **Aggregation**: min/max/avg buckets cached and invalidated per reading
//! - **Alerts**: per-metric limits with quiet hours
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`StreamSubscriber`] | Keeps one live subscription open |
//! | [`Reconciler`] | Orders live events and backfilled pages into the store |
//! | [`Aggregator`] | Windowed statistics with an incremental cache |
//! | [`SyncCoordinator`] | Worker per sensor, query and observation surface |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tanksync_core::mock::{MockFeed, MockHistory, StaticIdentity};
//! use tanksync_core::{Sources, SyncConfig, SyncCoordinator};
//! use tanksync_types::TimeRange;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sources = Sources::new(
//!         Arc::new(MockFeed::new()),
//!         Arc::new(MockHistory::new()),
//!         Arc::new(StaticIdentity::new("token")),
//!     );
//!     let coordinator = SyncCoordinator::new(sources, SyncConfig::default())?;
//!     coordinator.subscribe("tank-1/ph").await?;
//!
//!     let range = TimeRange::from_millis(0, 3_600_000)?;
//!     match coordinator.query("tank-1/ph", range, 60_000).await {
//!         Ok(series) => println!("{} buckets, {:?}", series.buckets.len(), series.health),
//!         Err(tanksync_core::Error::UncoveredRange { missing, .. }) => {
//!             println!("waiting for {} ranges", missing.len())
//!         }
//!         Err(e) => return Err(e.into()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod mock;
pub mod reconciler;
pub mod source;
pub mod subscriber;
pub mod thresholds;
pub mod timeline;
mod worker;

pub use aggregator::{Aggregator, AggregatorStats, BucketKey};
pub use backoff::{Backoff, BackoffPolicy, with_retry};
pub use config::SyncConfig;
pub use coordinator::{DataHealth, SensorStatus, Series, SyncCoordinator, infer_metric};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SyncEvent};
pub use reconciler::{GapState, Reconciler, Step};
pub use source::{
    Credential, FeedEvent, FeedStream, HistorySource, IdentityProvider, LiveFeed, Page,
    PageCursor, PageRequest, Sources,
};
pub use subscriber::{LinkSignal, StreamSubscriber};
pub use thresholds::{Level, MetricLimits, QuietHours, ThresholdConfig, Thresholds};
pub use timeline::{SharedTimeline, Timeline};

// Re-export the crates callers need for the public API
pub use tanksync_store::{self as store, InsertOutcome, ReadingStore, RetentionLimit};
pub use tanksync_types::{self as types, ConnectionState, Reading, SequenceRange, TimeRange, Timestamp};
