//! Mock backend for testing.
//!
//! This module provides scriptable stand-ins for the three backend seams so
//! the engine can be exercised without a network:
//!
//! - [`MockFeed`]: a [`LiveFeed`] that plays back one scripted session per
//!   `subscribe` call, including connect failures and mid-stream drops
//! - [`MockHistory`]: a [`HistorySource`] with configurable page size,
//!   page order, failure injection and sequences it never returns
//! - [`StaticIdentity`]: an [`IdentityProvider`] that can be revoked
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tanksync_core::mock::{MockFeed, MockHistory, StaticIdentity};
//! use tanksync_core::{FeedEvent, Sources};
//! use tanksync_types::{Reading, Timestamp};
//!
//! let feed = Arc::new(MockFeed::new());
//! feed.push_events(vec![FeedEvent::Reading(Reading::new("tank/ph", 1, Timestamp::from_millis(0), 7.0))]);
//!
//! let history = Arc::new(MockHistory::new().page_size(50));
//! let sources = Sources::new(feed, history, Arc::new(StaticIdentity::new("token")));
//! # let _ = sources;
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tanksync_types::{Reading, SequenceRange};

use crate::error::{Error, Result};
use crate::source::{
    Credential, FeedEvent, FeedStream, HistorySource, IdentityProvider, LiveFeed, Page,
    PageCursor, PageRequest,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A failure the mocks can inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Becomes [`Error::TransientNetwork`].
    Transient(String),
    /// Becomes [`Error::Unauthorized`].
    Unauthorized(String),
}

impl MockFailure {
    /// A transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// An unauthorized failure.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    fn to_error(&self, operation: &str) -> Error {
        match self {
            MockFailure::Transient(message) => Error::transient(operation, message.clone()),
            MockFailure::Unauthorized(message) => Error::unauthorized(message.clone()),
        }
    }
}

/// Item sent through a channel-driven mock session.
pub type MockItem = std::result::Result<FeedEvent, MockFailure>;

enum MockSession {
    /// `subscribe` itself fails.
    Fail(MockFailure),
    /// Yield the items, then end, fail, or hang.
    Script {
        items: Vec<MockItem>,
        then_hang: bool,
    },
    /// Forward items from a test-held sender; ends when it is dropped.
    Channel(mpsc::UnboundedReceiver<MockItem>),
}

/// A scripted [`LiveFeed`].
///
/// Each call to `subscribe` consumes the next queued session. Once the queue
/// is empty, sessions hang forever without events.
#[derive(Default)]
pub struct MockFeed {
    sessions: Mutex<VecDeque<MockSession>>,
    subscribe_times: Mutex<Vec<Instant>>,
    connect_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFeed")
            .field("queued_sessions", &lock(&self.sessions).len())
            .field("subscribe_count", &self.subscribe_count())
            .finish()
    }
}

impl MockFeed {
    /// Create a feed with no queued sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session that yields `events` and then ends (a disconnect).
    pub fn push_events(&self, events: Vec<FeedEvent>) {
        lock(&self.sessions).push_back(MockSession::Script {
            items: events.into_iter().map(Ok).collect(),
            then_hang: false,
        });
    }

    /// Queue a session that yields `events` and then stays open.
    pub fn push_events_then_hang(&self, events: Vec<FeedEvent>) {
        lock(&self.sessions).push_back(MockSession::Script {
            items: events.into_iter().map(Ok).collect(),
            then_hang: true,
        });
    }

    /// Queue a session that yields `events` and then fails with `failure`.
    pub fn push_events_then_fail(&self, events: Vec<FeedEvent>, failure: MockFailure) {
        let mut items: Vec<MockItem> = events.into_iter().map(Ok).collect();
        items.push(Err(failure));
        lock(&self.sessions).push_back(MockSession::Script {
            items,
            then_hang: false,
        });
    }

    /// Queue a connect failure.
    pub fn push_failure(&self, failure: MockFailure) {
        lock(&self.sessions).push_back(MockSession::Fail(failure));
    }

    /// Queue a session driven by the returned sender.
    ///
    /// Dropping the sender ends the session.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<MockItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.sessions).push_back(MockSession::Channel(rx));
        tx
    }

    /// Delay every `subscribe` call by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of `subscribe` calls so far, failed or not.
    pub fn subscribe_count(&self) -> usize {
        lock(&self.subscribe_times).len()
    }

    /// When each `subscribe` call happened.
    pub fn subscribe_times(&self) -> Vec<Instant> {
        lock(&self.subscribe_times).clone()
    }
}

#[async_trait]
impl LiveFeed for MockFeed {
    async fn subscribe(&self, sensor_id: &str, _credential: &Credential) -> Result<FeedStream> {
        lock(&self.subscribe_times).push(Instant::now());

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let session = lock(&self.sessions).pop_front();
        let operation = format!("subscribe {}", sensor_id);
        let to_result = move |item: MockItem| item.map_err(|f| f.to_error("live feed"));

        match session {
            None => Ok(stream::pending::<Result<FeedEvent>>().boxed()),
            Some(MockSession::Fail(failure)) => Err(failure.to_error(&operation)),
            Some(MockSession::Script { items, then_hang }) => {
                let scripted = stream::iter(items).map(to_result);
                if then_hang {
                    Ok(scripted.chain(stream::pending()).boxed())
                } else {
                    Ok(scripted.boxed())
                }
            }
            Some(MockSession::Channel(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .map(to_result)
            .boxed()),
        }
    }
}

/// An in-memory [`HistorySource`].
///
/// Pages are slices of the matching readings; the cursor is the offset of the
/// next slice.
pub struct MockHistory {
    readings: Mutex<BTreeMap<String, BTreeMap<u64, Reading>>>,
    page_size: usize,
    descending: bool,
    omitted: Mutex<HashSet<u64>>,
    remaining_failures: AtomicU32,
    unauthorized: AtomicBool,
    latency_ms: AtomicU64,
    requests: Mutex<Vec<(String, PageRequest)>>,
}

impl Default for MockHistory {
    fn default() -> Self {
        Self {
            readings: Mutex::new(BTreeMap::new()),
            page_size: 100,
            descending: false,
            omitted: Mutex::new(HashSet::new()),
            remaining_failures: AtomicU32::new(0),
            unauthorized: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for MockHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHistory")
            .field("page_size", &self.page_size)
            .field("descending", &self.descending)
            .finish_non_exhaustive()
    }
}

impl MockHistory {
    /// Create an empty history with 100 readings per page.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size (at least 1).
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Serve pages newest-first.
    #[must_use]
    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    /// Add readings to the backend.
    pub fn extend(&self, readings: impl IntoIterator<Item = Reading>) {
        let mut map = lock(&self.readings);
        for reading in readings {
            map.entry(reading.sensor_id.clone())
                .or_default()
                .insert(reading.sequence, reading);
        }
    }

    /// Never return this sequence, as if the backend lost it.
    pub fn omit(&self, sequence: u64) {
        lock(&self.omitted).insert(sequence);
    }

    /// Stop omitting every sequence.
    pub fn restore_omitted(&self) {
        lock(&self.omitted).clear();
    }

    /// Fail the next `count` page fetches with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Reject every fetch as unauthorized.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::Relaxed);
    }

    /// Delay every fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<(String, PageRequest)> {
        lock(&self.requests).clone()
    }

    /// Distinct sequence ranges requested for `sensor_id`.
    pub fn requested_ranges(&self, sensor_id: &str) -> Vec<SequenceRange> {
        let mut ranges: Vec<SequenceRange> = lock(&self.requests)
            .iter()
            .filter(|(id, _)| id == sensor_id)
            .map(|(_, req)| req.range)
            .collect();
        ranges.sort();
        ranges.dedup();
        ranges
    }
}

#[async_trait]
impl HistorySource for MockHistory {
    async fn fetch_page(
        &self,
        sensor_id: &str,
        request: PageRequest,
        _credential: &Credential,
    ) -> Result<Page> {
        lock(&self.requests).push((sensor_id.to_string(), request.clone()));

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::unauthorized("history access revoked"));
        }
        if self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::transient("fetch_page", "injected failure"));
        }

        let omitted = lock(&self.omitted).clone();
        let mut matching: Vec<Reading> = lock(&self.readings)
            .get(sensor_id)
            .map(|m| {
                m.range(request.range.first..=request.range.last)
                    .filter(|(seq, _)| !omitted.contains(seq))
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default();
        if self.descending {
            matching.reverse();
        }

        let offset = match &request.cursor {
            Some(cursor) => cursor
                .as_str()
                .parse::<usize>()
                .map_err(|_| Error::transient("fetch_page", "bad cursor"))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(matching.len());
        let readings = matching.get(offset..end).map(<[Reading]>::to_vec).unwrap_or_default();
        let next = (end < matching.len()).then(|| PageCursor::new(end.to_string()));

        Ok(Page { readings, next })
    }
}

/// An [`IdentityProvider`] returning a fixed token until revoked.
#[derive(Debug)]
pub struct StaticIdentity {
    token: String,
    revoked: AtomicBool,
}

impl StaticIdentity {
    /// Provide `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            revoked: AtomicBool::new(false),
        }
    }

    /// Make every call fail with [`Error::Unauthorized`].
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Relaxed);
    }

    /// Undo [`revoke`](Self::revoke), as after re-authentication.
    pub fn restore(&self) {
        self.revoked.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn credential(&self) -> Result<Credential> {
        if self.revoked.load(Ordering::Relaxed) {
            Err(Error::unauthorized("credential revoked"))
        } else {
            Ok(Credential::new(self.token.clone()))
        }
    }
}
