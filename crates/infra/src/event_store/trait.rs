use std::sync::Arc;

use thiserror::Error;

use eventlog_core::AggregateId;
use eventlog_events::{DomainEvent, SerializationError};

use super::query::{AllEventsPage, GlobalPosition};
use crate::stream_store::StoreError;

/// Event store operation error.
///
/// Write-path errors are returned to the caller as-is; the store never retries on
/// the caller's behalf.
///
/// - **ConcurrencyConflict**: the expected version disagrees with the committed one,
///   confirmed against the backing store. Re-read and retry.
/// - **StoreUnavailable**: the backing store could not be reached; the outcome of a
///   write may be unknown.
/// - **VersionSequence**: the caller supplied event versions that do not continue
///   the stream contiguously. Nothing was written.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error(
        "concurrency conflict on stream {stream_id}: expected version {expected}, actual {actual}"
    )]
    ConcurrencyConflict {
        stream_id: AggregateId,
        expected: u64,
        actual: u64,
    },

    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("event {index} has version {found}, expected {expected}")]
    VersionSequence { index: usize, expected: u64, found: u64 },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("store error: {0}")]
    Store(String),
}

impl EventStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for EventStoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => EventStoreError::StoreUnavailable(msg),
            other => EventStoreError::Store(other.to_string()),
        }
    }
}

/// Append-only event log with per-aggregate optimistic concurrency.
///
/// ## Streams
///
/// Every aggregate owns one stream whose versions run `1..=N` with no gaps. Every
/// committed event is also appended to one global stream, in commit order.
///
/// ## Optimistic concurrency
///
/// Writers present the version they last observed (`expected_version`, `0` for a new
/// aggregate). Of all writers presenting the same `(stream, expected_version)`, exactly
/// one commits; the others get [`EventStoreError::ConcurrencyConflict`].
pub trait EventStore: Send + Sync {
    /// Append one event whose version must be `expected_version + 1`.
    ///
    /// Returns the new stream version.
    fn append(
        &self,
        event: &DomainEvent,
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError>;

    /// Append a contiguous run of events atomically.
    ///
    /// `events[i].version()` must be `expected_version + i + 1`. An empty batch writes
    /// nothing and returns the current stream version.
    fn append_batch(
        &self,
        events: &[DomainEvent],
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError>;

    /// Events of one stream with `from_version <= version <= to_version`, in order.
    ///
    /// Malformed records are skipped.
    fn read_from_stream(
        &self,
        stream_id: AggregateId,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Up to `max_count` events of the global stream after `from`.
    ///
    /// Without a cap the rest of the stream is read.
    fn read_all_events(
        &self,
        from: &GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<AllEventsPage, EventStoreError>;

    /// Current committed version of a stream (`0` if it has no events).
    fn stream_version(&self, stream_id: AggregateId) -> Result<u64, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        event: &DomainEvent,
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        (**self).append(event, stream_id, expected_version)
    }

    fn append_batch(
        &self,
        events: &[DomainEvent],
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        (**self).append_batch(events, stream_id, expected_version)
    }

    fn read_from_stream(
        &self,
        stream_id: AggregateId,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).read_from_stream(stream_id, from_version, to_version)
    }

    fn read_all_events(
        &self,
        from: &GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<AllEventsPage, EventStoreError> {
        (**self).read_all_events(from, max_count)
    }

    fn stream_version(&self, stream_id: AggregateId) -> Result<u64, EventStoreError> {
        (**self).stream_version(stream_id)
    }
}
