//! Operation counters for the event store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// Kind of append being recorded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendKind {
    Single,
    Batch,
}

/// Lock-free counters updated on every append and read.
#[derive(Debug)]
pub struct EventStoreMetrics {
    single_appends: AtomicU64,
    batch_appends: AtomicU64,
    reads: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    concurrency_conflicts: AtomicU64,
    events_appended: AtomicU64,
    events_read: AtomicU64,
    malformed_records: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_time_micros: AtomicU64,
    max_time_micros: AtomicU64,
    report_interval: Duration,
    last_report: Mutex<Instant>,
}

/// Point-in-time copy of [`EventStoreMetrics`] with derived rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub single_appends: u64,
    pub batch_appends: u64,
    pub reads: u64,
    pub successes: u64,
    pub failures: u64,
    pub concurrency_conflicts: u64,
    pub events_appended: u64,
    pub events_read: u64,
    pub malformed_records: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub max_operation_micros: u64,
    pub avg_operation_micros: f64,
    /// Percentage of completed operations that succeeded.
    pub success_rate: f64,
    /// Percentage of version lookups served from the cache.
    pub cache_hit_rate: f64,
}

impl Default for EventStoreMetrics {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_METRICS_REPORT_INTERVAL)
    }
}

impl EventStoreMetrics {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            single_appends: AtomicU64::new(0),
            batch_appends: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            concurrency_conflicts: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
            events_read: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            total_time_micros: AtomicU64::new(0),
            max_time_micros: AtomicU64::new(0),
            report_interval,
            last_report: Mutex::new(Instant::now()),
        }
    }

    pub fn record_append(&self, kind: AppendKind) {
        match kind {
            AppendKind::Single => self.single_appends.fetch_add(1, Ordering::Relaxed),
            AppendKind::Batch => self.batch_appends.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.record_time(elapsed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.record_time(elapsed);
    }

    pub fn record_conflict(&self) {
        self.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_appended(&self, count: u64) {
        self.events_appended.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_events_read(&self, count: u64) {
        self.events_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_time_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_time_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let successes = load(&self.successes);
        let failures = load(&self.failures);
        let completed = successes + failures;
        let cache_hits = load(&self.cache_hits);
        let cache_misses = load(&self.cache_misses);
        let lookups = cache_hits + cache_misses;

        MetricsSnapshot {
            single_appends: load(&self.single_appends),
            batch_appends: load(&self.batch_appends),
            reads: load(&self.reads),
            successes,
            failures,
            concurrency_conflicts: load(&self.concurrency_conflicts),
            events_appended: load(&self.events_appended),
            events_read: load(&self.events_read),
            malformed_records: load(&self.malformed_records),
            cache_hits,
            cache_misses,
            max_operation_micros: load(&self.max_time_micros),
            avg_operation_micros: ratio(load(&self.total_time_micros), completed),
            success_rate: 100.0 * ratio(successes, completed),
            cache_hit_rate: 100.0 * ratio(cache_hits, lookups),
        }
    }

    /// Log a snapshot at `info` if the report interval has elapsed since the last one.
    ///
    /// Returns `true` when a report was emitted.
    pub fn maybe_report(&self) -> bool {
        {
            let mut last = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < self.report_interval {
                return false;
            }
            *last = Instant::now();
        }

        let s = self.snapshot();
        info!(
            single_appends = s.single_appends,
            batch_appends = s.batch_appends,
            reads = s.reads,
            failures = s.failures,
            concurrency_conflicts = s.concurrency_conflicts,
            events_appended = s.events_appended,
            events_read = s.events_read,
            success_rate = s.success_rate,
            cache_hit_rate = s.cache_hit_rate,
            avg_operation_micros = s.avg_operation_micros,
            max_operation_micros = s.max_operation_micros,
            "event store metrics"
        );
        true
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
