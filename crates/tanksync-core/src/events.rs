//! Sync event notifications.
//!
//! The coordinator broadcasts a [`SyncEvent`] for every state change a
//! display or alerting layer may care about. Slow receivers lag and lose the
//! oldest events; the state itself is always available from
//! [`SyncCoordinator::status`](crate::SyncCoordinator::status).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tanksync_types::{ConnectionState, Metric, SequenceRange, Timestamp};

use crate::thresholds::Level;

/// Events emitted by the sync engine.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyncEvent {
    /// A sensor's connection state changed.
    StateChanged {
        sensor_id: String,
        state: ConnectionState,
    },
    /// Missing sequences were detected and requested.
    GapDetected {
        sensor_id: String,
        missing: SequenceRange,
    },
    /// A gap was fully backfilled.
    GapClosed {
        sensor_id: String,
        range: SequenceRange,
    },
    /// A gap could not be closed after all retries.
    GapUnresolved {
        sensor_id: String,
        missing: SequenceRange,
        error: String,
    },
    /// The credential was rejected; the sensor waits for resubscription.
    Unauthorized { sensor_id: String, message: String },
    /// An applied reading moved outside (or back inside) its limits.
    ThresholdCrossed {
        sensor_id: String,
        metric: Metric,
        level: Level,
        value: f64,
        timestamp: Timestamp,
    },
    /// Retention removed readings.
    ReadingsEvicted {
        count: usize,
        oldest: Option<Timestamp>,
        newest: Option<Timestamp>,
    },
}

impl SyncEvent {
    /// The sensor this event concerns, if any.
    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            SyncEvent::StateChanged { sensor_id, .. }
            | SyncEvent::GapDetected { sensor_id, .. }
            | SyncEvent::GapClosed { sensor_id, .. }
            | SyncEvent::GapUnresolved { sensor_id, .. }
            | SyncEvent::Unauthorized { sensor_id, .. }
            | SyncEvent::ThresholdCrossed { sensor_id, .. } => Some(sensor_id),
            SyncEvent::ReadingsEvicted { .. } => None,
        }
    }
}

/// Sender for sync events.
pub type EventSender = broadcast::Sender<SyncEvent>;

/// Receiver for sync events.
pub type EventReceiver = broadcast::Receiver<SyncEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a dispatcher buffering up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SyncEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
