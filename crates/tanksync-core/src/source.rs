//! Seams to the telemetry backend.
//!
//! The engine talks to three collaborators, all behind `async_trait` traits
//! so tests and the simulator can stand in for the real backend:
//!
//! - [`LiveFeed`]: push stream of new readings per sensor
//! - [`HistorySource`]: paginated historical readings by sequence range
//! - [`IdentityProvider`]: opaque credentials for both

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use tanksync_types::{Reading, SequenceRange};

use crate::error::Result;

/// Opaque credential handed to the backend.
///
/// The token is never printed; `Debug` shows a redacted placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for transports that need to send it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// One item of a live feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A new reading, delivered in backend sequence order.
    Reading(Reading),
    /// The backend has delivered everything it buffered for this session.
    CaughtUp,
}

/// Stream returned by [`LiveFeed::subscribe`].
///
/// The stream may end or yield errors at any point; both are treated as a
/// disconnect.
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedEvent>> + Send>>;

/// Push feed of new readings.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    /// Open a live session for one sensor.
    ///
    /// The feed may skip sequences, repeat them, or drop the session; the
    /// reconciler handles all three.
    async fn subscribe(&self, sensor_id: &str, credential: &Credential) -> Result<FeedStream>;
}

/// Resume token for paginated history requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(String);

impl PageCursor {
    /// Wrap a backend cursor.
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// The raw cursor value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Request for one page of historical readings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Sequences to fetch.
    pub range: SequenceRange,
    /// Cursor from the previous page, `None` for the first page.
    pub cursor: Option<PageCursor>,
}

impl PageRequest {
    /// First page of `range`.
    pub fn first(range: SequenceRange) -> Self {
        Self {
            range,
            cursor: None,
        }
    }
}

/// One page of historical readings.
///
/// Readings may come in ascending or descending sequence order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Readings in this page.
    pub readings: Vec<Reading>,
    /// Cursor for the next page, `None` on the last page.
    pub next: Option<PageCursor>,
}

/// Paginated access to historical readings.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch one page of readings with sequences in `request.range`.
    async fn fetch_page(
        &self,
        sensor_id: &str,
        request: PageRequest,
        credential: &Credential,
    ) -> Result<Page>;
}

/// Source of backend credentials.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current credential.
    ///
    /// Returns [`Error::Unauthorized`](crate::Error::Unauthorized) when the
    /// user must re-authenticate; the engine never retries that on its own.
    async fn credential(&self) -> Result<Credential>;
}

/// The three backend collaborators bundled for sharing across tasks.
#[derive(Clone)]
pub struct Sources {
    /// Live push feed.
    pub feed: Arc<dyn LiveFeed>,
    /// Paginated history.
    pub history: Arc<dyn HistorySource>,
    /// Credential provider.
    pub identity: Arc<dyn IdentityProvider>,
}

impl Sources {
    /// Bundle the collaborators.
    pub fn new(
        feed: Arc<dyn LiveFeed>,
        history: Arc<dyn HistorySource>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            feed,
            history,
            identity,
        }
    }
}

impl fmt::Debug for Sources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sources").finish_non_exhaustive()
    }
}
