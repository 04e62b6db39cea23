//! Per-sensor worker and backfill tasks.
//!
//! Each subscribed sensor gets one [`SensorWorker`] task that owns the
//! sensor's [`Reconciler`]. Two producers feed it through independent
//! channels: the [`StreamSubscriber`] (live signals) and any number of
//! [`BackfillTask`]s (pages). The worker is the only consumer, so all
//! reconciliation for a sensor is serialized without shared counters.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tanksync_types::{ConnectionState, Metric, Reading, SequenceRange};

use crate::backoff::{BackoffPolicy, with_retry};
use crate::config::SyncConfig;
use crate::coordinator::{DataHealth, SensorStatus};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SyncEvent};
use crate::reconciler::{GapState, Reconciler, Step};
use crate::source::{HistorySource, IdentityProvider, Page, PageRequest, Sources};
use crate::subscriber::{LinkSignal, StreamSubscriber};
use crate::thresholds::{Level, Thresholds};
use crate::timeline::SharedTimeline;

/// Requests from the coordinator to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Re-request every unresolved gap.
    RetryGap,
    /// Drop the current subscription and start a fresh one.
    Resubscribe,
}

/// Output of a backfill task.
#[derive(Debug)]
pub(crate) enum BackfillMsg {
    Page {
        range: SequenceRange,
        readings: Vec<Reading>,
    },
    Done {
        range: SequenceRange,
    },
    Failed {
        range: SequenceRange,
        error: Error,
    },
}

/// Fetches every page of one sequence range.
pub(crate) struct BackfillTask {
    sensor_id: String,
    range: SequenceRange,
    history: Arc<dyn HistorySource>,
    identity: Arc<dyn IdentityProvider>,
    policy: BackoffPolicy,
    passes: u32,
    cancel: CancellationToken,
    tx: mpsc::Sender<BackfillMsg>,
}

impl BackfillTask {
    pub(crate) async fn run(self) {
        let range = self.range;
        debug!(sensor = %self.sensor_id, %range, "Backfill started");

        for pass in 1..=self.passes.max(1) {
            let mut received = BTreeSet::new();
            let mut cursor = None;

            loop {
                let request = PageRequest {
                    range,
                    cursor: cursor.take(),
                };
                let page = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    page = self.fetch(request) => page,
                };

                let page = match page {
                    Ok(page) => page,
                    Err(Error::Cancelled) => return,
                    Err(error) => {
                        let _ = self.tx.send(BackfillMsg::Failed { range, error }).await;
                        return;
                    }
                };

                received.extend(
                    page.readings
                        .iter()
                        .map(|r| r.sequence)
                        .filter(|seq| range.contains(*seq)),
                );
                let readings = page.readings;
                if !readings.is_empty()
                    && self
                        .tx
                        .send(BackfillMsg::Page { range, readings })
                        .await
                        .is_err()
                {
                    return;
                }

                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }

            if received.len() as u64 >= range.len() {
                break;
            }
            warn!(
                sensor = %self.sensor_id,
                %range,
                pass,
                received = received.len(),
                "Backfill pass returned an incomplete range"
            );
        }

        // The reconciler decides whether the range actually closed.
        let _ = self.tx.send(BackfillMsg::Done { range }).await;
    }

    async fn fetch(&self, request: PageRequest) -> Result<Page> {
        let op = || {
            let history = Arc::clone(&self.history);
            let identity = Arc::clone(&self.identity);
            let sensor_id = self.sensor_id.clone();
            let request = request.clone();
            async move {
                let credential = identity.credential().await?;
                history.fetch_page(&sensor_id, request, &credential).await
            }
        };
        with_retry(&self.policy, "fetch_page", &self.cancel, op).await
    }
}

/// Everything a worker needs at spawn time.
pub(crate) struct WorkerParts {
    pub sensor_id: String,
    pub metric: Option<Metric>,
    pub reconciler: Reconciler,
    pub timeline: SharedTimeline,
    pub sources: Sources,
    pub config: SyncConfig,
    pub thresholds: Thresholds,
    pub events: EventDispatcher,
    pub cancel: CancellationToken,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub status: watch::Sender<SensorStatus>,
}

/// Serializing consumer for one sensor.
pub(crate) struct SensorWorker {
    sensor_id: String,
    metric: Option<Metric>,
    reconciler: Reconciler,
    timeline: SharedTimeline,
    sources: Sources,
    config: SyncConfig,
    thresholds: Thresholds,
    events: EventDispatcher,
    cancel: CancellationToken,
    control: mpsc::UnboundedReceiver<Control>,
    status: watch::Sender<SensorStatus>,

    link_cancel: CancellationToken,
    link_rx: mpsc::Receiver<LinkSignal>,
    backfill_tx: mpsc::Sender<BackfillMsg>,
    backfill_rx: mpsc::Receiver<BackfillMsg>,

    link_state: ConnectionState,
    published_state: ConnectionState,
    unauthorized: bool,
    level: Option<Level>,
    last_reading: Option<Reading>,
    applied: u64,
    duplicates: u64,
    dropped: u64,
    gaps_detected: u64,
}

impl SensorWorker {
    pub(crate) fn new(parts: WorkerParts) -> Self {
        let (backfill_tx, backfill_rx) = mpsc::channel(parts.config.channel_capacity);
        // Replaced by the first subscriber in `run`.
        let (_, link_rx) = mpsc::channel(1);

        Self {
            sensor_id: parts.sensor_id,
            metric: parts.metric,
            reconciler: parts.reconciler,
            timeline: parts.timeline,
            sources: parts.sources,
            config: parts.config,
            thresholds: parts.thresholds,
            events: parts.events,
            link_cancel: parts.cancel.child_token(),
            cancel: parts.cancel,
            control: parts.control,
            status: parts.status,
            link_rx,
            backfill_tx,
            backfill_rx,
            link_state: ConnectionState::Disconnected,
            published_state: ConnectionState::Disconnected,
            unauthorized: false,
            level: None,
            last_reading: None,
            applied: 0,
            duplicates: 0,
            dropped: 0,
            gaps_detected: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(sensor = %self.sensor_id, "Sensor worker started");
        self.last_reading = {
            let timeline = self.timeline.lock().await;
            timeline.store().latest(&self.sensor_id)
        };
        self.spawn_subscriber();
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                control = self.control.recv() => match control {
                    Some(Control::RetryGap) => self.retry_gaps(),
                    Some(Control::Resubscribe) => self.resubscribe(),
                    None => break,
                },
                Some(msg) = self.backfill_rx.recv() => self.on_backfill(msg).await,
                Some(signal) = self.link_rx.recv() => self.on_link(signal).await,
            }
        }

        self.link_cancel.cancel();
        self.link_state = ConnectionState::Disconnected;
        self.publish();
        info!(sensor = %self.sensor_id, "Sensor worker stopped");
    }

    fn spawn_subscriber(&mut self) {
        self.link_cancel.cancel();
        self.link_cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        // Dropping the old receiver stops any signal still in flight from
        // the previous subscription.
        self.link_rx = rx;
        self.link_state = ConnectionState::Disconnected;

        StreamSubscriber::new(
            self.sensor_id.clone(),
            Arc::clone(&self.sources.feed),
            Arc::clone(&self.sources.identity),
            self.config.stream_policy(),
            self.link_cancel.clone(),
            tx,
        )
        .spawn();
    }

    fn spawn_backfill(&self, range: SequenceRange) {
        let task = BackfillTask {
            sensor_id: self.sensor_id.clone(),
            range,
            history: Arc::clone(&self.sources.history),
            identity: Arc::clone(&self.sources.identity),
            policy: self.config.backfill_policy(),
            passes: self.config.backfill_passes,
            cancel: self.cancel.child_token(),
            tx: self.backfill_tx.clone(),
        };
        tokio::spawn(task.run());
    }

    async fn on_link(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::State(state) => {
                self.link_state = state;
                if state == ConnectionState::Live {
                    self.unauthorized = false;
                }
            }
            LinkSignal::Reading(reading) => {
                let step = {
                    let mut timeline = self.timeline.lock().await;
                    self.reconciler.on_live(&mut timeline, reading)
                };
                self.after_step(step);
            }
            LinkSignal::Unauthorized(message) => {
                warn!(sensor = %self.sensor_id, "Re-authentication required: {}", message);
                self.unauthorized = true;
                self.events.send(SyncEvent::Unauthorized {
                    sensor_id: self.sensor_id.clone(),
                    message,
                });
            }
        }
        self.publish();
    }

    async fn on_backfill(&mut self, msg: BackfillMsg) {
        match msg {
            BackfillMsg::Page { readings, .. } => {
                let step = {
                    let mut timeline = self.timeline.lock().await;
                    self.reconciler.on_backfill_page(&mut timeline, readings)
                };
                self.after_step(step);
            }
            BackfillMsg::Done { range } => {
                let step = self.reconciler.on_backfill_done(range);
                let escalated = self
                    .reconciler
                    .unresolved()
                    .into_iter()
                    .find(|r| r.last == range.last);
                self.after_step(step);
                if let Some(missing) = escalated {
                    self.events.send(SyncEvent::GapUnresolved {
                        sensor_id: self.sensor_id.clone(),
                        missing,
                        error: "backfill returned an incomplete range".to_string(),
                    });
                }
            }
            BackfillMsg::Failed { range, error } => {
                warn!(sensor = %self.sensor_id, %range, "Backfill failed: {}", error);
                self.reconciler.on_backfill_failed(range);
                if error.is_unauthorized() {
                    self.unauthorized = true;
                    self.events.send(SyncEvent::Unauthorized {
                        sensor_id: self.sensor_id.clone(),
                        message: error.to_string(),
                    });
                }
                self.events.send(SyncEvent::GapUnresolved {
                    sensor_id: self.sensor_id.clone(),
                    missing: range,
                    error: error.to_string(),
                });
            }
        }
        self.publish();
    }

    fn after_step(&mut self, step: Step) {
        self.applied += step.applied.len() as u64;
        self.duplicates += step.duplicates as u64;
        self.dropped += step.dropped as u64;

        for range in step.requests {
            self.gaps_detected += 1;
            self.events.send(SyncEvent::GapDetected {
                sensor_id: self.sensor_id.clone(),
                missing: range,
            });
            self.spawn_backfill(range);
        }
        for range in step.closed {
            self.events.send(SyncEvent::GapClosed {
                sensor_id: self.sensor_id.clone(),
                range,
            });
        }

        if let Some(newest) = step.applied.into_iter().max_by_key(Reading::order_key) {
            self.check_thresholds(&newest);
            let is_newer = self
                .last_reading
                .as_ref()
                .is_none_or(|last| newest.order_key() > last.order_key());
            if is_newer {
                self.last_reading = Some(newest);
            }
        }
    }

    /// Emit an event when the newest reading changes level.
    fn check_thresholds(&mut self, reading: &Reading) {
        let Some(metric) = self.metric else {
            return;
        };
        let level = self.thresholds.evaluate(metric, reading.value);
        if self.level == Some(level) {
            return;
        }
        let previous = self.level.replace(level);
        if previous.is_none() && !level.is_alert() {
            return;
        }

        if level.is_alert() {
            info!(
                sensor = %self.sensor_id,
                metric = metric.as_str(),
                value = reading.value,
                "Reading {:?} outside limits",
                level
            );
        }
        self.events.send(SyncEvent::ThresholdCrossed {
            sensor_id: self.sensor_id.clone(),
            metric,
            level,
            value: reading.value,
            timestamp: reading.timestamp,
        });
    }

    fn retry_gaps(&mut self) {
        for range in self.reconciler.retry() {
            self.spawn_backfill(range);
        }
        self.publish();
    }

    fn resubscribe(&mut self) {
        info!(sensor = %self.sensor_id, "Resubscribing");
        self.unauthorized = false;
        self.spawn_subscriber();
        self.retry_gaps();
    }

    /// State shown to the display layer.
    fn effective_state(&self) -> ConnectionState {
        match self.link_state {
            ConnectionState::Live if self.reconciler.state() != GapState::Synced => {
                ConnectionState::Backfilling
            }
            state => state,
        }
    }

    fn health(&self) -> DataHealth {
        if self.unauthorized {
            return DataHealth::AuthRequired;
        }
        match self.reconciler.state() {
            GapState::Synced => DataHealth::Healthy,
            GapState::Backfilling => DataHealth::Backfilling {
                missing: self.reconciler.missing(),
            },
            GapState::GapUnresolved => DataHealth::Degraded {
                missing: self.reconciler.missing(),
            },
        }
    }

    fn publish(&mut self) {
        let state = self.effective_state();
        if state != self.published_state {
            debug!(sensor = %self.sensor_id, from = %self.published_state, to = %state, "State changed");
            self.published_state = state;
            self.events.send(SyncEvent::StateChanged {
                sensor_id: self.sensor_id.clone(),
                state,
            });
        }

        let status = SensorStatus {
            sensor_id: self.sensor_id.clone(),
            metric: self.metric,
            state,
            health: self.health(),
            last_sequence: self.reconciler.last_sequence(),
            last_reading: self.last_reading.clone(),
            pending: self.reconciler.pending_len(),
            applied: self.applied,
            duplicates: self.duplicates,
            dropped: self.dropped,
            gaps_detected: self.gaps_detected,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
