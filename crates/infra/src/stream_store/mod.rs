//! Backing append-log store boundary.
//!
//! This is the narrow set of stream primitives the event log needs from its store:
//! append (plain and length-guarded transactional), length, range scan, key listing,
//! and the consumer-group family (create, read, pending, claim, ack). Anything that
//! offers these, such as Redis Streams, can back the event log.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use eventlog_events::EventRecord;

pub use in_memory::InMemoryStreamStore;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamStore;

/// Store-assigned identifier of one stream entry (e.g. `1718000000000-0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub record: EventRecord,
}

/// One append inside a transactional write.
#[derive(Debug, Clone, Copy)]
pub struct StreamWrite<'a> {
    pub key: &'a str,
    pub record: &'a EventRecord,
}

/// Precondition of a transactional write: `key` must hold exactly `expected` entries.
#[derive(Debug, Clone, Copy)]
pub struct LengthGuard<'a> {
    pub key: &'a str,
    pub expected: u64,
}

/// Result of a length-guarded transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalAppend {
    /// All writes were applied atomically; ids are in write order.
    Committed(Vec<EntryId>),
    /// The guarded stream did not have the expected length; nothing was written.
    LengthMismatch { actual: u64 },
}

/// Outcome of creating a consumer group.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// Where a range scan starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeStart {
    /// The first entry of the stream.
    First,
    /// The entry immediately after the given id (exclusive cursor).
    After(EntryId),
}

/// Pending (delivered but unacknowledged) entries of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub total: u64,
    /// Per-consumer pending counts.
    pub consumers: Vec<(String, u64)>,
}

/// One pending entry with its ownership and idle clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Backing store failure, classified by what the caller can do about it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport or connection failure; the operation outcome may be unknown.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The consumer group (or its stream) does not exist (`NOGROUP`).
    #[error("consumer group or stream missing: {0}")]
    GroupMissing(String),

    /// The store rejected the command.
    #[error("store command failed: {0}")]
    Command(String),
}

/// Stream primitives required from the backing store.
///
/// Implementations must:
/// - keep each stream append-only and in append order
/// - apply `append_conditional` atomically: the length check and every write happen
///   in one transaction, or nothing is written
/// - own all consumer-group state (cursors, pending entries, idle clocks)
pub trait StreamStore: Send + Sync {
    /// Append one entry outside any transaction.
    fn append(&self, key: &str, record: &EventRecord) -> Result<EntryId, StoreError>;

    /// Apply `writes` in one transaction if `guard.key` holds exactly `guard.expected` entries.
    fn append_conditional(
        &self,
        guard: LengthGuard<'_>,
        writes: &[StreamWrite<'_>],
    ) -> Result<ConditionalAppend, StoreError>;

    /// Number of entries in a stream (0 if it does not exist).
    fn stream_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Entries from `start` in stream order, at most `count` if given.
    fn range(
        &self,
        key: &str,
        start: &RangeStart,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Keys of all existing streams starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Create `group` on an existing stream, positioned at the latest entry.
    fn create_group(&self, key: &str, group: &str) -> Result<GroupCreation, StoreError>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting at most `block`.
    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    fn pending_summary(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError>;

    /// Pending entries in id order, optionally only those owned by `consumer`.
    fn pending_entries(
        &self,
        key: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Transfer ownership of the listed entries idle for at least `min_idle` to `consumer`.
    ///
    /// Returns the entries actually claimed.
    fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Remove entries from the group's pending set. Returns how many were removed.
    fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError>;
}

impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    fn append(&self, key: &str, record: &EventRecord) -> Result<EntryId, StoreError> {
        (**self).append(key, record)
    }

    fn append_conditional(
        &self,
        guard: LengthGuard<'_>,
        writes: &[StreamWrite<'_>],
    ) -> Result<ConditionalAppend, StoreError> {
        (**self).append_conditional(guard, writes)
    }

    fn stream_len(&self, key: &str) -> Result<u64, StoreError> {
        (**self).stream_len(key)
    }

    fn range(
        &self,
        key: &str,
        start: &RangeStart,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).range(key, start, count)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).keys(prefix)
    }

    fn create_group(&self, key: &str, group: &str) -> Result<GroupCreation, StoreError> {
        (**self).create_group(key, group)
    }

    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).read_group(key, group, consumer, count, block)
    }

    fn pending_summary(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError> {
        (**self).pending_summary(key, group)
    }

    fn pending_entries(
        &self,
        key: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        (**self).pending_entries(key, group, consumer, count)
    }

    fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).claim(key, group, consumer, min_idle, ids)
    }

    fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        (**self).ack(key, group, ids)
    }
}
