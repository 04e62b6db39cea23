//! Error types for tanksync-core.
//!
//! # Error Classification
//!
//! | Error | Handling |
//! |-------|----------|
//! | [`Error::TransientNetwork`] | Retried with backoff; surfaced once retries are exhausted |
//! | [`Error::Unauthorized`] | Surfaced immediately, never retried automatically |
//! | [`Error::GapUnresolved`] | Reported as degraded data; retried on resubscribe or explicit retry |
//! | [`Error::UncoveredRange`] | Query result telling the caller to wait or backfill |
//! | [`Error::Cancelled`] | Operation stopped by unsubscribe or shutdown |
//!
//! Duplicate readings are not errors; the store reports them through
//! [`InsertOutcome::DuplicateIgnored`](tanksync_store::InsertOutcome).

use thiserror::Error;

use tanksync_types::{ParseError, SequenceRange, TimeRange};

/// Errors produced by the sync engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A network or backend failure that may succeed on retry.
    #[error("Transient network error during {operation}: {message}")]
    TransientNetwork {
        /// What was being attempted.
        operation: String,
        /// Backend or transport message.
        message: String,
    },

    /// The identity provider or backend rejected the credential.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A sequence gap could not be closed after all retries.
    #[error("Gap unresolved for {sensor_id}: missing {missing}")]
    GapUnresolved {
        /// Affected sensor.
        sensor_id: String,
        /// Sequences that could not be fetched.
        missing: SequenceRange,
    },

    /// A query touched time ranges that are not known to be complete.
    #[error("Range not covered for {sensor_id} ({} missing sub-ranges)", .missing.len())]
    UncoveredRange {
        /// Queried sensor.
        sensor_id: String,
        /// Sub-ranges without a complete window.
        missing: Vec<TimeRange>,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A malformed range or bucket width.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// The sensor is not subscribed and has no cached data.
    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    /// Subscribing would exceed the configured subscription limit.
    #[error("Subscription limit of {limit} sensors reached")]
    SubscriptionLimit {
        /// Configured maximum.
        limit: usize,
    },

    /// Snapshot persistence failed.
    #[error(transparent)]
    Store(#[from] tanksync_store::Error),
}

impl Error {
    /// Create a transient network error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an invalid range error.
    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::InvalidRange(message.into())
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientNetwork { .. })
    }

    /// Whether the error means the credential must be refreshed.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::InvalidRange(err.to_string())
    }
}

/// Result type alias using tanksync-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
