//! Event store over a [`StreamStore`]: the append engine and the catch-up reader.
//!
//! Each aggregate gets a private stream `<prefix><aggregate id>` whose length equals
//! its committed version; every event is also appended to the global stream
//! `<prefix><all events>` inside the same transaction. The committed-version check
//! runs against the [`VersionCache`] first and against the store when the cache
//! disagrees, and the store re-checks the stream length inside the transaction, so
//! two writers with identical cached state still cannot both commit.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use eventlog_core::AggregateId;
use eventlog_events::{DomainEvent, EventRecord, EventSerializer, JsonEventSerializer};

use super::metrics::{AppendKind, EventStoreMetrics, MetricsSnapshot};
use super::query::{AllEventsPage, GlobalPosition};
use super::r#trait::{EventStore, EventStoreError};
use super::version_cache::VersionCache;
use crate::config::EventStoreConfig;
use crate::stream_store::{ConditionalAppend, LengthGuard, RangeStart, StreamEntry, StreamStore, StreamWrite};

pub struct StreamEventStore<S, Z = JsonEventSerializer> {
    store: S,
    serializer: Z,
    config: EventStoreConfig,
    cache: Arc<VersionCache>,
    metrics: Arc<EventStoreMetrics>,
    all_events_key: String,
}

impl<S> StreamEventStore<S, JsonEventSerializer>
where
    S: StreamStore,
{
    pub fn new(store: S, config: EventStoreConfig) -> Self {
        Self::with_serializer(store, JsonEventSerializer::new(), config)
    }
}

impl<S, Z> StreamEventStore<S, Z>
where
    S: StreamStore,
    Z: EventSerializer,
{
    pub fn with_serializer(store: S, serializer: Z, config: EventStoreConfig) -> Self {
        let metrics = Arc::new(EventStoreMetrics::new(config.metrics_report_interval));
        Self {
            all_events_key: config.all_events_key(),
            store,
            serializer,
            config,
            cache: Arc::new(VersionCache::new()),
            metrics,
        }
    }

    /// Use an externally owned cache (e.g. one shared with other store handles).
    pub fn with_cache(mut self, cache: Arc<VersionCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<VersionCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<EventStoreMetrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    pub fn stream_store(&self) -> &S {
        &self.store
    }

    /// Committed version of `stream_id` read from the store, bypassing and refreshing the cache.
    fn load_version(&self, stream_id: AggregateId) -> Result<u64, EventStoreError> {
        let key = self.config.stream_key(stream_id);
        match self.store.stream_len(&key) {
            Ok(version) => {
                self.cache.set(stream_id, version);
                Ok(version)
            }
            Err(err) => {
                self.cache.invalidate(stream_id);
                Err(err.into())
            }
        }
    }

    /// Resolve the committed version and confirm it equals `expected_version`.
    ///
    /// A cache entry that disagrees is dropped and the version re-read from the store
    /// before declaring a conflict.
    fn check_expected_version(
        &self,
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        let cached = self.cache.get(stream_id);
        self.metrics.record_cache_lookup(cached.is_some());

        if cached == Some(expected_version) {
            return Ok(expected_version);
        }

        if cached.is_some() {
            debug!(
                stream_id = %stream_id,
                cached = ?cached,
                expected_version,
                "cached version disagrees, re-reading from store"
            );
            self.cache.invalidate(stream_id);
        }

        let actual = self.load_version(stream_id)?;
        if actual != expected_version {
            return Err(self.conflict(stream_id, expected_version, actual));
        }
        Ok(actual)
    }

    fn conflict(&self, stream_id: AggregateId, expected: u64, actual: u64) -> EventStoreError {
        self.metrics.record_conflict();
        warn!(
            stream_id = %stream_id,
            expected_version = expected,
            actual_version = actual,
            "version conflict"
        );
        EventStoreError::ConcurrencyConflict {
            stream_id,
            expected,
            actual,
        }
    }

    /// Version check, sequence validation, encoding, and the guarded transactional write.
    fn commit(
        &self,
        events: &[DomainEvent],
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        if let Some(foreign) = events.iter().find(|e| e.aggregate_id() != stream_id) {
            return Err(EventStoreError::InvalidAppend(format!(
                "event {} belongs to aggregate {}, not stream {}",
                foreign.event_id(),
                foreign.aggregate_id(),
                stream_id
            )));
        }

        let current = self.check_expected_version(stream_id, expected_version)?;

        for (index, event) in events.iter().enumerate() {
            let expected = current + index as u64 + 1;
            if event.version() != expected {
                return Err(EventStoreError::VersionSequence {
                    index,
                    expected,
                    found: event.version(),
                });
            }
        }

        let records = events
            .iter()
            .map(|e| self.serializer.serialize(e))
            .collect::<Result<Vec<EventRecord>, _>>()?;

        let stream_key = self.config.stream_key(stream_id);
        let writes: Vec<StreamWrite<'_>> = records
            .iter()
            .flat_map(|record| {
                [
                    StreamWrite {
                        key: &stream_key,
                        record,
                    },
                    StreamWrite {
                        key: &self.all_events_key,
                        record,
                    },
                ]
            })
            .collect();

        let guard = LengthGuard {
            key: &stream_key,
            expected: current,
        };

        match self.store.append_conditional(guard, &writes) {
            Ok(ConditionalAppend::Committed(_)) => {
                let new_version = current + events.len() as u64;
                self.cache.set(stream_id, new_version);
                self.metrics.record_events_appended(events.len() as u64);
                info!(
                    stream_id = %stream_id,
                    from_version = current + 1,
                    to_version = new_version,
                    "events appended"
                );
                Ok(new_version)
            }
            Ok(ConditionalAppend::LengthMismatch { actual }) => {
                self.cache.invalidate(stream_id);
                Err(self.conflict(stream_id, expected_version, actual))
            }
            Err(err) => {
                self.cache.invalidate(stream_id);
                error!(stream_id = %stream_id, error = %err, "append transaction failed");
                Err(err.into())
            }
        }
    }

    fn timed_append(
        &self,
        kind: AppendKind,
        events: &[DomainEvent],
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        self.metrics.record_append(kind);
        let started = Instant::now();

        let result = self.commit(events, stream_id, expected_version);

        match &result {
            Ok(_) => self.metrics.record_success(started.elapsed()),
            Err(_) => self.metrics.record_failure(started.elapsed()),
        }
        self.metrics.maybe_report();
        result
    }

    /// Decode a stored entry, skipping bootstrap sentinels and malformed records.
    fn decode(&self, stream_key: &str, entry: &StreamEntry) -> Option<DomainEvent> {
        if entry.record.is_init_sentinel() {
            return None;
        }
        match self.serializer.deserialize(&entry.record) {
            Ok(event) => Some(event),
            Err(err) => {
                self.metrics.record_malformed();
                error!(
                    stream_key = %stream_key,
                    entry_id = %entry.id,
                    error = %err,
                    "skipping malformed record"
                );
                None
            }
        }
    }

    fn timed_read<T>(
        &self,
        read: impl FnOnce() -> Result<T, EventStoreError>,
        count: impl Fn(&T) -> usize,
    ) -> Result<T, EventStoreError> {
        self.metrics.record_read();
        let started = Instant::now();

        let result = read();

        match &result {
            Ok(value) => {
                self.metrics.record_events_read(count(value) as u64);
                self.metrics.record_success(started.elapsed());
            }
            Err(_) => self.metrics.record_failure(started.elapsed()),
        }
        self.metrics.maybe_report();
        result
    }

    fn read_page(
        &self,
        from: &GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<AllEventsPage, EventStoreError> {
        let mut events = Vec::new();
        let mut position = from.clone();
        let mut reached_end = false;

        loop {
            let remaining = match max_count {
                Some(max) => max - events.len(),
                None => usize::MAX,
            };
            if remaining == 0 {
                break;
            }
            // Never fetch more entries than events still wanted, so the cursor does not
            // run past entries this page will not return.
            let chunk = remaining.min(self.config.max_batch_size);

            let entries = self
                .store
                .range(&self.all_events_key, &position.to_range_start(), Some(chunk))?;
            let fetched = entries.len();

            for entry in &entries {
                if let Some(event) = self.decode(&self.all_events_key, entry) {
                    events.push(event);
                }
            }
            if let Some(last) = entries.into_iter().last() {
                position = GlobalPosition::After(last.id);
            }

            if fetched < chunk {
                reached_end = true;
                break;
            }
        }

        Ok(AllEventsPage {
            events,
            next_position: position,
            reached_end,
        })
    }
}

impl<S, Z> EventStore for StreamEventStore<S, Z>
where
    S: StreamStore,
    Z: EventSerializer,
{
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), version = event.version()),
        err
    )]
    fn append(
        &self,
        event: &DomainEvent,
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        self.timed_append(
            AppendKind::Single,
            std::slice::from_ref(event),
            stream_id,
            expected_version,
        )
    }

    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    fn append_batch(
        &self,
        events: &[DomainEvent],
        stream_id: AggregateId,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        if events.is_empty() {
            return self.stream_version(stream_id);
        }
        self.timed_append(AppendKind::Batch, events, stream_id, expected_version)
    }

    #[instrument(skip(self), err)]
    fn read_from_stream(
        &self,
        stream_id: AggregateId,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let key = self.config.stream_key(stream_id);
        self.timed_read(
            || {
                let entries = self.store.range(&key, &RangeStart::First, None)?;
                Ok(entries
                    .iter()
                    .filter_map(|entry| self.decode(&key, entry))
                    .filter(|e| {
                        e.version() >= from_version && to_version.is_none_or(|to| e.version() <= to)
                    })
                    .collect())
            },
            Vec::len,
        )
    }

    #[instrument(skip(self), err)]
    fn read_all_events(
        &self,
        from: &GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<AllEventsPage, EventStoreError> {
        self.timed_read(|| self.read_page(from, max_count), |page| page.events.len())
    }

    fn stream_version(&self, stream_id: AggregateId) -> Result<u64, EventStoreError> {
        let cached = self.cache.get(stream_id);
        self.metrics.record_cache_lookup(cached.is_some());

        match cached {
            Some(version) => Ok(version),
            None => self.load_version(stream_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_store::InMemoryStreamStore;
    use chrono::Utc;
    use eventlog_core::EventId;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(aggregate_id: AggregateId, version: u64) -> DomainEvent {
        DomainEvent::new(
            EventId::new(),
            aggregate_id,
            version,
            Utc::now(),
            "horse.registered",
            json!({ "n": version }),
        )
    }

    fn events(aggregate_id: AggregateId, versions: std::ops::RangeInclusive<u64>) -> Vec<DomainEvent> {
        versions.map(|v| event(aggregate_id, v)).collect()
    }

    fn setup() -> (Arc<InMemoryStreamStore>, StreamEventStore<Arc<InMemoryStreamStore>>) {
        let store = Arc::new(InMemoryStreamStore::new());
        let event_store = StreamEventStore::new(store.clone(), EventStoreConfig::default());
        (store, event_store)
    }

    #[test]
    fn append_writes_aggregate_and_global_streams() {
        let (store, es) = setup();
        let id = AggregateId::new();

        assert_eq!(es.append(&event(id, 1), id, 0).unwrap(), 1);
        assert_eq!(es.append(&event(id, 2), id, 1).unwrap(), 2);

        let config = es.config();
        assert_eq!(store.stream_len(&config.stream_key(id)).unwrap(), 2);
        assert_eq!(store.stream_len(&config.all_events_key()).unwrap(), 2);
        assert_eq!(es.stream_version(id).unwrap(), 2);
    }

    #[test]
    fn batch_then_stale_single_reports_actual_version() {
        let (_, es) = setup();
        let id = AggregateId::new();

        assert_eq!(es.append_batch(&events(id, 1..=3), id, 0).unwrap(), 3);

        let err = es.append(&event(id, 1), id, 0).unwrap_err();
        match err {
            EventStoreError::ConcurrencyConflict {
                stream_id,
                expected,
                actual,
            } => {
                assert_eq!(stream_id, id);
                assert_eq!(expected, 0);
                assert_eq!(actual, 3);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn non_contiguous_batch_writes_nothing() {
        let (store, es) = setup();
        let id = AggregateId::new();
        es.append(&event(id, 1), id, 0).unwrap();

        let gap = vec![event(id, 2), event(id, 4)];
        let err = es.append_batch(&gap, id, 1).unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::VersionSequence {
                index: 1,
                expected: 3,
                found: 4
            }
        ));

        let wrong_start = vec![event(id, 1), event(id, 2)];
        assert!(matches!(
            es.append_batch(&wrong_start, id, 1).unwrap_err(),
            EventStoreError::VersionSequence { index: 0, .. }
        ));

        assert_eq!(store.stream_len(&es.config().stream_key(id)).unwrap(), 1);
        assert_eq!(store.stream_len(&es.config().all_events_key()).unwrap(), 1);
    }

    #[test]
    fn single_event_with_wrong_version_is_rejected() {
        let (_, es) = setup();
        let id = AggregateId::new();

        let err = es.append(&event(id, 5), id, 0).unwrap_err();
        assert!(matches!(err, EventStoreError::VersionSequence { expected: 1, found: 5, .. }));
        assert_eq!(es.stream_version(id).unwrap(), 0);
    }

    #[test]
    fn foreign_event_is_rejected() {
        let (_, es) = setup();
        let err = es
            .append(&event(AggregateId::new(), 1), AggregateId::new(), 0)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[test]
    fn empty_batch_returns_current_version() {
        let (_, es) = setup();
        let id = AggregateId::new();
        es.append_batch(&events(id, 1..=2), id, 0).unwrap();

        assert_eq!(es.append_batch(&[], id, 0).unwrap(), 2);
    }

    #[test]
    fn store_failure_invalidates_cache() {
        let (store, es) = setup();
        let id = AggregateId::new();
        es.append(&event(id, 1), id, 0).unwrap();
        assert_eq!(es.cache().get(id), Some(1));

        store.set_available(false);
        let err = es.append(&event(id, 2), id, 1).unwrap_err();
        assert!(matches!(err, EventStoreError::StoreUnavailable(_)));
        assert_eq!(es.cache().get(id), None);

        store.set_available(true);
        assert_eq!(es.append(&event(id, 2), id, 1).unwrap(), 2);
    }

    #[test]
    fn stale_cache_is_caught_by_the_store() {
        let store = Arc::new(InMemoryStreamStore::new());
        let a = StreamEventStore::new(store.clone(), EventStoreConfig::default());
        let b = StreamEventStore::new(store.clone(), EventStoreConfig::default());
        let id = AggregateId::new();

        a.append(&event(id, 1), id, 0).unwrap();
        assert_eq!(b.stream_version(id).unwrap(), 1);
        a.append(&event(id, 2), id, 1).unwrap();

        // b still believes version 1.
        let err = b.append(&event(id, 2), id, 1).unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { expected: 1, actual: 2, .. }));
        assert_eq!(b.cache().get(id), None);

        assert_eq!(b.append(&event(id, 3), id, 2).unwrap(), 3);
    }

    #[test]
    fn concurrent_writers_with_same_expected_version_one_wins() {
        let store = Arc::new(InMemoryStreamStore::new());
        let id = AggregateId::new();
        let seed = StreamEventStore::new(store.clone(), EventStoreConfig::default());
        seed.append_batch(&events(id, 1..=2), id, 0).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let es = StreamEventStore::new(store, EventStoreConfig::default());
                    es.append(&event(id, 3), id, 2)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(seed.read_from_stream(id, 1, None).unwrap().len(), 3);
    }

    #[test]
    fn read_from_stream_filters_inclusive_range() {
        let (_, es) = setup();
        let id = AggregateId::new();
        es.append_batch(&events(id, 1..=10), id, 0).unwrap();

        let versions: Vec<u64> = es
            .read_from_stream(id, 3, Some(5))
            .unwrap()
            .iter()
            .map(DomainEvent::version)
            .collect();
        assert_eq!(versions, vec![3, 4, 5]);

        assert_eq!(es.read_from_stream(id, 8, None).unwrap().len(), 3);
        assert!(es.read_from_stream(AggregateId::new(), 1, None).unwrap().is_empty());
    }

    #[test]
    fn malformed_records_are_skipped() {
        let (store, es) = setup();
        let id = AggregateId::new();
        es.append(&event(id, 1), id, 0).unwrap();

        let key = es.config().stream_key(id);
        let garbage: EventRecord = [("eventType", "x"), ("version", "not-a-number")]
            .into_iter()
            .collect();
        store.append(&key, &garbage).unwrap();
        store.append(&es.config().all_events_key(), &garbage).unwrap();

        assert_eq!(es.read_from_stream(id, 1, None).unwrap().len(), 1);
        assert_eq!(es.read_all_events(&GlobalPosition::Start, None).unwrap().events.len(), 1);
        assert_eq!(es.metrics_snapshot().malformed_records, 2);
    }

    #[test]
    fn read_all_events_pages_with_cursor() {
        let store = Arc::new(InMemoryStreamStore::new());
        let es = StreamEventStore::new(
            store.clone(),
            EventStoreConfig::default().with_max_batch_size(2),
        );
        let (a, b) = (AggregateId::new(), AggregateId::new());

        store
            .append(&es.config().all_events_key(), &EventRecord::init_sentinel())
            .unwrap();
        es.append_batch(&events(a, 1..=3), a, 0).unwrap();
        es.append_batch(&events(b, 1..=2), b, 0).unwrap();

        // The sentinel is consumed but not returned.
        let first = es.read_all_events(&GlobalPosition::Start, Some(2)).unwrap();
        let ids: Vec<_> = first.events.iter().map(|e| (e.aggregate_id(), e.version())).collect();
        assert_eq!(ids, vec![(a, 1), (a, 2)]);
        assert!(!first.reached_end);

        let second = es.read_all_events(&first.next_position, Some(3)).unwrap();
        let ids: Vec<_> = second.events.iter().map(|e| (e.aggregate_id(), e.version())).collect();
        assert_eq!(ids, vec![(a, 3), (b, 1), (b, 2)]);

        let rest = es.read_all_events(&second.next_position, None).unwrap();
        assert!(rest.events.is_empty());
        assert!(rest.reached_end);
        assert_eq!(rest.next_position, second.next_position);

        let everything = es.read_all_events(&GlobalPosition::Start, None).unwrap();
        assert_eq!(everything.events.len(), 5);
        assert!(everything.reached_end);
    }

    #[test]
    fn metrics_count_appends_conflicts_and_cache_hits() {
        let (_, es) = setup();
        let id = AggregateId::new();

        es.append(&event(id, 1), id, 0).unwrap();
        es.append(&event(id, 2), id, 1).unwrap();
        es.append(&event(id, 2), id, 1).unwrap_err();

        let s = es.metrics_snapshot();
        assert_eq!(s.single_appends, 3);
        assert_eq!(s.successes, 2);
        assert_eq!(s.failures, 1);
        assert_eq!(s.concurrency_conflicts, 1);
        assert_eq!(s.events_appended, 2);
        assert!(s.cache_hits >= 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        /// Any mix of batches, stale retries and gapped batches leaves versions 1..=N.
        #[test]
        fn successful_appends_keep_versions_contiguous(
            ops in prop::collection::vec((1usize..4, 0u64..3, any::<bool>()), 1..20)
        ) {
            let (_, es) = setup();
            let id = AggregateId::new();
            let mut committed = 0u64;

            for (size, staleness, gapped) in ops {
                let expected = committed.saturating_sub(staleness);
                let mut batch: Vec<DomainEvent> = (1..=size as u64)
                    .map(|i| event(id, expected + i))
                    .collect();
                if gapped && size > 1 {
                    batch[size - 1] = event(id, expected + size as u64 + 1);
                }

                match es.append_batch(&batch, id, expected) {
                    Ok(v) => {
                        prop_assert_eq!(expected, committed);
                        prop_assert!(!(gapped && size > 1));
                        committed = v;
                    }
                    Err(EventStoreError::ConcurrencyConflict { actual, .. }) => {
                        prop_assert!(expected != committed);
                        prop_assert_eq!(actual, committed);
                    }
                    Err(EventStoreError::VersionSequence { .. }) => {
                        prop_assert!(gapped && size > 1);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                }
            }

            let versions: Vec<u64> = es
                .read_from_stream(id, 1, None)
                .unwrap()
                .iter()
                .map(DomainEvent::version)
                .collect();
            prop_assert_eq!(versions, (1..=committed).collect::<Vec<_>>());
        }
    }
}
