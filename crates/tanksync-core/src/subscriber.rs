//! Live-feed subscription with automatic reconnection.
//!
//! A [`StreamSubscriber`] owns one logical subscription to a sensor's live
//! feed. It runs as a background task and reports everything it sees as
//! [`LinkSignal`]s over an mpsc channel, in delivery order:
//!
//! - `Connecting` before each connection attempt
//! - `Live` once the first event or a caught-up marker arrives
//! - `Disconnected` after the session fails or ends, followed by a backoff
//!   sleep and another attempt
//!
//! An unauthorized credential stops the subscriber instead of retrying.
//! Cancelling the token stops it within one tick, including during a
//! backoff sleep or a pending connect.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tanksync_types::{ConnectionState, Reading};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::{Error, Result};
use crate::source::{FeedEvent, IdentityProvider, LiveFeed};

/// What a subscriber reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    /// The connection state changed.
    State(ConnectionState),
    /// A live reading, in delivery order.
    Reading(Reading),
    /// The credential was rejected; the subscriber has stopped.
    Unauthorized(String),
}

/// How a single live session ended.
enum SessionEnd {
    /// Network failure, backend error or end of stream.
    Failed(Error),
    /// Credential rejected.
    Unauthorized(String),
    /// The consumer went away.
    Closed,
}

/// Maintains a live subscription for one sensor.
pub struct StreamSubscriber {
    sensor_id: String,
    feed: Arc<dyn LiveFeed>,
    identity: Arc<dyn IdentityProvider>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    tx: mpsc::Sender<LinkSignal>,
}

impl StreamSubscriber {
    /// Create a subscriber; nothing happens until [`spawn`](Self::spawn).
    pub fn new(
        sensor_id: impl Into<String>,
        feed: Arc<dyn LiveFeed>,
        identity: Arc<dyn IdentityProvider>,
        policy: BackoffPolicy,
        cancel: CancellationToken,
        tx: mpsc::Sender<LinkSignal>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            feed,
            identity,
            policy,
            cancel,
            tx,
        }
    }

    /// Run the subscription loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the subscription loop until cancelled, unauthorized, or the
    /// consumer drops its receiver.
    pub async fn run(self) {
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            if self.cancel.is_cancelled() || !self.signal(LinkSignal::State(ConnectionState::Connecting)).await {
                break;
            }

            let end = tokio::select! {
                _ = self.cancel.cancelled() => break,
                end = self.session(&mut backoff) => end,
            };

            match end {
                SessionEnd::Closed => break,
                SessionEnd::Unauthorized(message) => {
                    warn!(sensor = %self.sensor_id, "Live feed unauthorized: {}", message);
                    let _ = self.signal(LinkSignal::State(ConnectionState::Disconnected)).await;
                    let _ = self.signal(LinkSignal::Unauthorized(message)).await;
                    break;
                }
                SessionEnd::Failed(err) => {
                    warn!(sensor = %self.sensor_id, "Live feed disconnected: {}", err);
                    if !self.signal(LinkSignal::State(ConnectionState::Disconnected)).await {
                        break;
                    }
                }
            }

            let Some(delay) = backoff.next_delay() else {
                warn!(
                    sensor = %self.sensor_id,
                    "Giving up on live feed after {} attempts",
                    backoff.attempt()
                );
                break;
            };
            info!(
                sensor = %self.sensor_id,
                attempt = backoff.attempt(),
                "Reconnecting in {:?}",
                delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        debug!(sensor = %self.sensor_id, "Subscriber stopped");
    }

    /// One connect-and-read session.
    async fn session(&self, backoff: &mut Backoff) -> SessionEnd {
        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(Error::Unauthorized(message)) => return SessionEnd::Unauthorized(message),
            Err(err) => return SessionEnd::Failed(err),
        };

        let mut live = false;
        loop {
            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(Error::Unauthorized(message))) => return SessionEnd::Unauthorized(message),
                Some(Err(err)) => return SessionEnd::Failed(err),
                None => return SessionEnd::Failed(Error::transient("live feed", "stream ended")),
            };

            if !live {
                live = true;
                backoff.reset();
                debug!(sensor = %self.sensor_id, "Live feed caught up");
                if !self.signal(LinkSignal::State(ConnectionState::Live)).await {
                    return SessionEnd::Closed;
                }
            }

            if let FeedEvent::Reading(reading) = event
                && !self.signal(LinkSignal::Reading(reading)).await
            {
                return SessionEnd::Closed;
            }
        }
    }

    async fn connect(&self) -> Result<crate::source::FeedStream> {
        let credential = self.identity.credential().await?;
        self.feed.subscribe(&self.sensor_id, &credential).await
    }

    /// Send a signal; false once the consumer is gone.
    async fn signal(&self, signal: LinkSignal) -> bool {
        self.tx.send(signal).await.is_ok()
    }
}
