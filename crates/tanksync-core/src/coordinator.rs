//! Orchestration of subscriptions, reconciliation and aggregation.
//!
//! [`SyncCoordinator`] is the query surface for the display layer. It owns
//! the shared [`Timeline`](crate::Timeline) and one worker task per
//! subscribed sensor, and it is the only place where internal sync state is
//! turned into caller-visible results:
//!
//! - an unresolved gap becomes [`DataHealth::Degraded`], never an error
//! - a rejected credential becomes [`DataHealth::AuthRequired`] plus a
//!   [`SyncEvent::Unauthorized`]
//! - a query over ranges that are not known to be complete fails with
//!   [`Error::UncoveredRange`] so the caller can wait for backfill
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use tanksync_core::mock::{MockFeed, MockHistory, StaticIdentity};
//! use tanksync_core::{Sources, SyncConfig, SyncCoordinator};
//!
//! # async fn example() -> tanksync_core::Result<()> {
//! let sources = Sources::new(
//!     Arc::new(MockFeed::new()),
//!     Arc::new(MockHistory::new()),
//!     Arc::new(StaticIdentity::new("token")),
//! );
//! let coordinator = SyncCoordinator::new(sources, SyncConfig::default())?;
//! coordinator.subscribe("tank-1/temperature").await?;
//!
//! let mut states = coordinator.observe("tank-1/temperature").await?;
//! while let Some(state) = states.next().await {
//!     println!("{state}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tanksync_store::{Eviction, ReadingStore, RetentionLimit};
use tanksync_types::{
    AggregateBucket, ConnectionState, DateFilter, Metric, Reading, SequenceRange, TimeRange,
    Timestamp,
};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, SyncEvent};
use crate::reconciler::Reconciler;
use crate::source::Sources;
use crate::thresholds::Thresholds;
use crate::timeline::{SharedTimeline, Timeline};
use crate::worker::{Control, SensorWorker, WorkerParts};

/// How trustworthy a sensor's data currently is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DataHealth {
    /// No known gaps.
    #[default]
    Healthy,
    /// Gaps are being backfilled.
    Backfilling { missing: Vec<SequenceRange> },
    /// Some gaps could not be closed; data around them is incomplete.
    Degraded { missing: Vec<SequenceRange> },
    /// The credential was rejected; resubscribe after re-authenticating.
    AuthRequired,
}

impl DataHealth {
    /// Whether the data is complete.
    pub fn is_healthy(&self) -> bool {
        matches!(self, DataHealth::Healthy)
    }
}

/// Snapshot of one subscribed sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub metric: Option<Metric>,
    pub state: ConnectionState,
    pub health: DataHealth,
    /// Last sequence applied without a gap.
    pub last_sequence: Option<u64>,
    /// Newest stored reading.
    pub last_reading: Option<Reading>,
    /// Readings buffered behind a gap.
    pub pending: usize,
    pub applied: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub gaps_detected: u64,
}

impl SensorStatus {
    fn new(sensor_id: &str, metric: Option<Metric>) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            metric,
            state: ConnectionState::Disconnected,
            health: DataHealth::Healthy,
            last_sequence: None,
            last_reading: None,
            pending: 0,
            applied: 0,
            duplicates: 0,
            dropped: 0,
            gaps_detected: 0,
        }
    }
}

/// Aggregated series returned by [`SyncCoordinator::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub sensor_id: String,
    pub range: TimeRange,
    pub bucket_width_ms: i64,
    pub buckets: Vec<AggregateBucket>,
    pub health: DataHealth,
}

struct SensorHandle {
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<SensorStatus>,
    task: JoinHandle<()>,
}

struct Inner {
    config: SyncConfig,
    sources: Sources,
    timeline: SharedTimeline,
    thresholds: Thresholds,
    events: EventDispatcher,
    sensors: RwLock<HashMap<String, SensorHandle>>,
    cancel: CancellationToken,
}

/// Coordinates live subscriptions, backfill and aggregate queries.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Metric named by the last path segment of a sensor id, e.g.
/// `tank-1/ph`.
pub fn infer_metric(sensor_id: &str) -> Option<Metric> {
    sensor_id.rsplit('/').next().and_then(|s| s.parse().ok())
}

/// Per-sensor view of the `StateChanged` broadcast.
struct StateObserver {
    sensor_id: String,
    events: EventReceiver,
    status: watch::Receiver<SensorStatus>,
    /// States to yield before reading events, popped from the back.
    queued: Vec<ConnectionState>,
    last: Option<ConnectionState>,
    worker_gone: bool,
}

impl StateObserver {
    async fn next_state(mut self) -> Option<(ConnectionState, Self)> {
        loop {
            let state = match self.queued.pop() {
                Some(state) => state,
                None => self.recv_state().await?,
            };
            if self.last != Some(state) {
                self.last = Some(state);
                return Some((state, self));
            }
        }
    }

    /// Next state of this sensor from the broadcast. Once the worker has
    /// exited, drains what it sent and ends.
    async fn recv_state(&mut self) -> Option<ConnectionState> {
        loop {
            let event = if self.worker_gone {
                match self.events.try_recv() {
                    Ok(event) => event,
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            } else {
                tokio::select! {
                    biased;
                    event = self.events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(sensor = %self.sensor_id, skipped, "State observer lagged");
                            return Some(self.status.borrow().state);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                    changed = self.status.changed() => {
                        if changed.is_err() {
                            self.worker_gone = true;
                        }
                        continue;
                    }
                }
            };
            if let SyncEvent::StateChanged { sensor_id, state } = event
                && sensor_id == self.sensor_id
            {
                return Some(state);
            }
        }
    }
}

impl SyncCoordinator {
    /// Create a coordinator with an empty store.
    pub fn new(sources: Sources, config: SyncConfig) -> Result<Self> {
        Self::with_store(sources, config, ReadingStore::new())
    }

    /// Create a coordinator resuming from a previously saved store.
    pub fn with_store(sources: Sources, config: SyncConfig, store: ReadingStore) -> Result<Self> {
        config.validate()?;
        let timeline = Timeline::new(store, config.aggregate_cache_capacity)
            .with_max_buckets(config.max_buckets_per_query)
            .shared();

        Ok(Self {
            inner: Arc::new(Inner {
                thresholds: Thresholds::new(config.thresholds.clone()),
                events: EventDispatcher::new(config.event_capacity),
                sources,
                timeline,
                sensors: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
                config,
            }),
        })
    }

    /// Start syncing `sensor_id`, inferring its metric from the id.
    ///
    /// Subscribing an already subscribed sensor is a no-op.
    pub async fn subscribe(&self, sensor_id: &str) -> Result<()> {
        self.subscribe_with_metric(sensor_id, infer_metric(sensor_id))
            .await
    }

    /// Start syncing `sensor_id`; `metric` selects the alert limits.
    pub async fn subscribe_with_metric(&self, sensor_id: &str, metric: Option<Metric>) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut sensors = self.inner.sensors.write().await;
        if sensors.contains_key(sensor_id) {
            debug!(sensor = %sensor_id, "Already subscribed");
            return Ok(());
        }
        if sensors.len() >= self.inner.config.max_subscriptions {
            return Err(Error::SubscriptionLimit {
                limit: self.inner.config.max_subscriptions,
            });
        }

        let reconciler = {
            let timeline = self.inner.timeline.lock().await;
            Reconciler::new(sensor_id, timeline.store(), self.inner.config.max_pending)
        };
        let cancel = self.inner.cancel.child_token();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SensorStatus::new(sensor_id, metric));

        let worker = SensorWorker::new(WorkerParts {
            sensor_id: sensor_id.to_string(),
            metric,
            reconciler,
            timeline: Arc::clone(&self.inner.timeline),
            sources: self.inner.sources.clone(),
            config: self.inner.config.clone(),
            thresholds: self.inner.thresholds.clone(),
            events: self.inner.events.clone(),
            cancel: cancel.clone(),
            control: control_rx,
            status: status_tx,
        });
        let task = tokio::spawn(worker.run());

        info!(sensor = %sensor_id, ?metric, "Subscribed");
        sensors.insert(
            sensor_id.to_string(),
            SensorHandle {
                cancel,
                control: control_tx,
                status: status_rx,
                task,
            },
        );
        Ok(())
    }

    /// Stop syncing `sensor_id`. Stored readings are kept.
    ///
    /// Returns false if the sensor was not subscribed.
    pub async fn unsubscribe(&self, sensor_id: &str) -> bool {
        let handle = self.inner.sensors.write().await.remove(sensor_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel.cancel();
        let _ = handle.task.await;
        info!(sensor = %sensor_id, "Unsubscribed");
        true
    }

    /// Restart the live subscription and retry unresolved gaps, e.g. after
    /// the user re-authenticated.
    pub async fn resubscribe(&self, sensor_id: &str) -> Result<()> {
        self.control(sensor_id, Control::Resubscribe).await
    }

    /// Retry backfill of every unresolved gap.
    pub async fn retry_gap(&self, sensor_id: &str) -> Result<()> {
        self.control(sensor_id, Control::RetryGap).await
    }

    async fn control(&self, sensor_id: &str, control: Control) -> Result<()> {
        let sensors = self.inner.sensors.read().await;
        let handle = sensors
            .get(sensor_id)
            .ok_or_else(|| Error::UnknownSensor(sensor_id.to_string()))?;
        handle.control.send(control).map_err(|_| Error::Cancelled)
    }

    /// Connection states of `sensor_id`: the current state, then each
    /// transition. Ends when the sensor is unsubscribed.
    ///
    /// Transitions come from the [`SyncEvent::StateChanged`] broadcast, so
    /// none are merged unless the consumer falls more than `event_capacity`
    /// events behind; it then resumes from the current state.
    pub async fn observe(&self, sensor_id: &str) -> Result<BoxStream<'static, ConnectionState>> {
        let status = self
            .inner
            .sensors
            .read()
            .await
            .get(sensor_id)
            .map(|h| h.status.clone())
            .ok_or_else(|| Error::UnknownSensor(sensor_id.to_string()))?;

        // Read before subscribing: a transition in between shows up on the
        // second read instead of being replayed out of order.
        let before = status.borrow().state;
        let events = self.inner.events.subscribe();
        let after = status.borrow().state;

        let mut queued = vec![before];
        if after != before {
            queued.push(after);
        }
        let observer = StateObserver {
            sensor_id: sensor_id.to_string(),
            events,
            status,
            queued: queued.into_iter().rev().collect(),
            last: None,
            worker_gone: false,
        };
        Ok(stream::unfold(observer, StateObserver::next_state).boxed())
    }

    /// Aggregate `sensor_id` over `range` in buckets of `bucket_width_ms`.
    pub async fn query(&self, sensor_id: &str, range: TimeRange, bucket_width_ms: i64) -> Result<Series> {
        let status = self.status(sensor_id).await;
        let buckets = {
            let mut timeline = self.inner.timeline.lock().await;
            if status.is_none() && timeline.store().windows(sensor_id).is_empty() {
                return Err(Error::UnknownSensor(sensor_id.to_string()));
            }
            timeline.query(sensor_id, &range, bucket_width_ms)?
        };

        Ok(Series {
            sensor_id: sensor_id.to_string(),
            range,
            bucket_width_ms,
            buckets,
            health: status.map(|s| s.health).unwrap_or_default(),
        })
    }

    /// [`query`](Self::query) over a preset range ending at the start of
    /// the current bucket.
    pub async fn query_filter(
        &self,
        sensor_id: &str,
        filter: DateFilter,
        bucket_width_ms: i64,
    ) -> Result<Series> {
        if bucket_width_ms <= 0 {
            return Err(Error::invalid_range(format!(
                "bucket width must be positive, got {bucket_width_ms}ms"
            )));
        }
        let range = filter.bucketed_range(Timestamp::now(), bucket_width_ms);
        self.query(sensor_id, range, bucket_width_ms).await
    }

    /// Current status of a subscribed sensor.
    pub async fn status(&self, sensor_id: &str) -> Option<SensorStatus> {
        self.inner
            .sensors
            .read()
            .await
            .get(sensor_id)
            .map(|h| h.status.borrow().clone())
    }

    /// Status of every subscribed sensor, sorted by id.
    pub async fn sensors(&self) -> Vec<SensorStatus> {
        let mut statuses: Vec<SensorStatus> = self
            .inner
            .sensors
            .read()
            .await
            .values()
            .map(|h| h.status.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        statuses
    }

    /// Subscribe to sync events.
    pub fn events(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Evict globally-oldest readings down to `limit`.
    pub async fn enforce_retention(&self, limit: RetentionLimit) -> usize {
        let eviction = self.inner.timeline.lock().await.evict_oldest(limit);
        self.report_eviction(&eviction);
        eviction.len()
    }

    /// Evict every reading older than `cutoff`.
    pub async fn evict_before(&self, cutoff: Timestamp) -> usize {
        let eviction = self.inner.timeline.lock().await.evict_before(cutoff);
        self.report_eviction(&eviction);
        eviction.len()
    }

    fn report_eviction(&self, eviction: &Eviction) {
        if eviction.is_empty() {
            return;
        }
        let oldest = eviction.removed.iter().map(|r| r.timestamp).min();
        info!(count = eviction.len(), "Evicted readings");
        self.inner.events.send(SyncEvent::ReadingsEvicted {
            count: eviction.len(),
            oldest,
            newest: eviction.newest(),
        });
    }

    /// The shared timeline, e.g. for snapshots.
    pub fn timeline(&self) -> SharedTimeline {
        Arc::clone(&self.inner.timeline)
    }

    /// The active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Stop every worker and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<(String, SensorHandle)> = self.inner.sensors.write().await.drain().collect();
        for (sensor_id, handle) in handles {
            if handle.task.await.is_err() {
                debug!(sensor = %sensor_id, "Worker task ended abnormally");
            }
        }
        info!("Sync coordinator stopped");
    }
}
