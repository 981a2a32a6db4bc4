//! Consumer-group poller: at-least-once delivery of committed events to handlers.
//!
//! Each tick runs two phases against one stream (the global stream by default):
//!
//! 1. **Poll**: read up to `max_batch_size` never-delivered entries for this
//!    consumer, blocking at most `poll_timeout`.
//! 2. **Reclaim**: if the group has pending entries, claim those idle for at least
//!    `claim_idle_timeout` (whichever consumer holds them) and redeliver them here.
//!
//! Every delivered entry is decoded, dispatched to the matching handlers, and then
//! acknowledged, whatever the handlers returned. Bootstrap sentinels and malformed
//! records are acknowledged without dispatch. Store errors never stop the loop: the
//! phase is skipped and the next tick retries.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use eventlog_events::{EventSerializer, HandlerRegistry, JsonEventSerializer};

use super::registrar::ConsumerGroupRegistrar;
use crate::config::EventStoreConfig;
use crate::stream_store::{StoreError, StreamEntry, StreamStore};

/// Poller runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub ticks: u64,
    /// Entries received from polls and claims (including sentinels and malformed).
    pub delivered: u64,
    pub claimed: u64,
    pub acknowledged: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub malformed_records: u64,
    pub sentinels: u64,
    /// Poll or reclaim phases skipped because of a store error.
    pub skipped_cycles: u64,
}

/// Handle to control a running poller thread.
#[derive(Debug)]
pub struct PollerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PollerStats>>,
}

impl PollerHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub struct ConsumerGroupPoller<S, Z = JsonEventSerializer> {
    store: S,
    serializer: Z,
    handlers: Arc<HandlerRegistry>,
    registrar: ConsumerGroupRegistrar<S>,
    config: EventStoreConfig,
    stream_key: String,
    group_ready: AtomicBool,
    stats: Arc<Mutex<PollerStats>>,
}

impl<S> ConsumerGroupPoller<S, JsonEventSerializer>
where
    S: StreamStore + Clone,
{
    /// Poller over the global stream using the JSON record format.
    ///
    /// `config` is used as given; run [`EventStoreConfig::validate`] on configs built
    /// with the `with_*` setters. [`EventStoreConfig::from_env`] already validates.
    pub fn new(store: S, handlers: Arc<HandlerRegistry>, config: EventStoreConfig) -> Self {
        Self::with_serializer(store, JsonEventSerializer::new(), handlers, config)
    }
}

impl<S, Z> ConsumerGroupPoller<S, Z>
where
    S: StreamStore + Clone,
    Z: EventSerializer,
{
    pub fn with_serializer(
        store: S,
        serializer: Z,
        handlers: Arc<HandlerRegistry>,
        config: EventStoreConfig,
    ) -> Self {
        Self {
            registrar: ConsumerGroupRegistrar::new(store.clone(), config.clone()),
            stream_key: config.all_events_key(),
            store,
            serializer,
            handlers,
            config,
            group_ready: AtomicBool::new(false),
            stats: Arc::new(Mutex::new(PollerStats::default())),
        }
    }

    /// Consume `key` instead of the global stream.
    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        self.stream_key = key.into();
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn stats(&self) -> PollerStats {
        self.stats_mut().clone()
    }

    fn stats_mut(&self) -> std::sync::MutexGuard<'_, PollerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the consumer group on the polled stream.
    ///
    /// Only the global stream is bootstrapped when empty.
    pub fn ensure_group(&self) -> Result<(), StoreError> {
        let bootstrap = self.stream_key == self.config.all_events_key();
        self.registrar.ensure_group(&self.stream_key, bootstrap)?;
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Read and process one batch of new entries. Returns how many entries were received.
    pub fn poll_once(&self) -> Result<usize, StoreError> {
        let entries = self.store.read_group(
            &self.stream_key,
            &self.config.consumer_group,
            &self.config.consumer_name,
            self.config.max_batch_size,
            self.config.poll_timeout,
        )?;

        if !entries.is_empty() {
            debug!(stream_key = %self.stream_key, count = entries.len(), "polled entries");
        }
        self.process_all(&entries);
        Ok(entries.len())
    }

    /// Claim and process entries left pending past the idle timeout. Returns how many were claimed.
    pub fn reclaim_once(&self) -> Result<usize, StoreError> {
        let group = &self.config.consumer_group;
        let summary = self.store.pending_summary(&self.stream_key, group)?;
        if summary.total == 0 {
            return Ok(0);
        }

        let idle_ids: Vec<_> = self
            .store
            .pending_entries(&self.stream_key, group, None, self.config.max_batch_size)?
            .into_iter()
            .filter(|p| p.idle >= self.config.claim_idle_timeout)
            .map(|p| p.id)
            .collect();
        if idle_ids.is_empty() {
            return Ok(0);
        }

        let claimed = self.store.claim(
            &self.stream_key,
            group,
            &self.config.consumer_name,
            self.config.claim_idle_timeout,
            &idle_ids,
        )?;

        if !claimed.is_empty() {
            info!(
                stream_key = %self.stream_key,
                consumer = %self.config.consumer_name,
                count = claimed.len(),
                "claimed idle pending entries"
            );
            self.stats_mut().claimed += claimed.len() as u64;
        }
        self.process_all(&claimed);
        Ok(claimed.len())
    }

    /// One scheduler tick: lazy group registration, poll, then reclaim.
    pub fn tick(&self) {
        self.stats_mut().ticks += 1;

        if self.config.create_consumer_group_if_not_exists
            && !self.group_ready.load(Ordering::Acquire)
        {
            if let Err(err) = self.ensure_group() {
                error!(stream_key = %self.stream_key, error = %err, "consumer group registration failed");
            }
        }

        if let Err(err) = self.poll_once() {
            self.skip_cycle("poll", err);
        }
        if let Err(err) = self.reclaim_once() {
            self.skip_cycle("reclaim", err);
        }
    }

    fn skip_cycle(&self, phase: &'static str, err: StoreError) {
        self.stats_mut().skipped_cycles += 1;
        match err {
            StoreError::GroupMissing(_) => {
                // Re-run registration on the next tick.
                self.group_ready.store(false, Ordering::Release);
                debug!(stream_key = %self.stream_key, phase, error = %err, "consumer group missing, skipping");
            }
            _ => error!(stream_key = %self.stream_key, phase, error = %err, "poller cycle failed"),
        }
    }

    fn process_all(&self, entries: &[StreamEntry]) {
        for entry in entries {
            self.process(entry);
        }
    }

    fn process(&self, entry: &StreamEntry) {
        self.stats_mut().delivered += 1;

        if entry.record.is_init_sentinel() {
            debug!(entry_id = %entry.id, "acknowledging bootstrap sentinel");
            self.stats_mut().sentinels += 1;
        } else {
            match self.serializer.deserialize(&entry.record) {
                Ok(event) => {
                    let report = self.handlers.dispatch(&event);
                    let mut stats = self.stats_mut();
                    stats.dispatched += 1;
                    stats.handler_failures += report.failures.len() as u64;
                }
                Err(err) => {
                    error!(entry_id = %entry.id, error = %err, "malformed record, acknowledging without dispatch");
                    self.stats_mut().malformed_records += 1;
                }
            }
        }

        self.acknowledge(entry);
    }

    fn acknowledge(&self, entry: &StreamEntry) {
        match self.store.ack(
            &self.stream_key,
            &self.config.consumer_group,
            std::slice::from_ref(&entry.id),
        ) {
            Ok(n) => self.stats_mut().acknowledged += n,
            // Left pending; reclaimed once idle.
            Err(err) => warn!(entry_id = %entry.id, error = %err, "failed to acknowledge entry"),
        }
    }
}

impl<S, Z> ConsumerGroupPoller<S, Z>
where
    S: StreamStore + Clone + 'static,
    Z: EventSerializer + 'static,
{
    /// Run the poller on its own thread, ticking with a fixed `poll_interval` delay.
    pub fn spawn(self) -> io::Result<PollerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = format!("poller-{}", self.config.consumer_name);

        let join = thread::Builder::new()
            .name(name)
            .spawn(move || poller_loop(self, shutdown_rx))?;

        Ok(PollerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn poller_loop<S, Z>(poller: ConsumerGroupPoller<S, Z>, shutdown_rx: mpsc::Receiver<()>)
where
    S: StreamStore + Clone,
    Z: EventSerializer,
{
    info!(
        stream_key = %poller.stream_key,
        group = %poller.config.consumer_group,
        consumer = %poller.config.consumer_name,
        "consumer group poller started"
    );

    loop {
        poller.tick();

        match shutdown_rx.recv_timeout(poller.config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(consumer = %poller.config.consumer_name, "consumer group poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventStore, StreamEventStore};
    use crate::stream_store::InMemoryStreamStore;
    use chrono::Utc;
    use eventlog_core::{AggregateId, EventId};
    use eventlog_events::{DomainEvent, EventRecord};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn event(aggregate_id: AggregateId, version: u64, event_type: &str) -> DomainEvent {
        DomainEvent::new(
            EventId::new(),
            aggregate_id,
            version,
            Utc::now(),
            event_type,
            serde_json::json!({}),
        )
    }

    fn counter(registry: &HandlerRegistry, event_type: Option<&str>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = move |_: &DomainEvent| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        match event_type {
            Some(t) => registry.register(t, handler),
            None => registry.register_all(handler),
        };
        count
    }

    struct Fixture {
        store: Arc<InMemoryStreamStore>,
        events: StreamEventStore<Arc<InMemoryStreamStore>>,
        handlers: Arc<HandlerRegistry>,
        config: EventStoreConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let config = EventStoreConfig::default().with_claim_idle_timeout(Duration::from_millis(250));
            let store = Arc::new(InMemoryStreamStore::new());
            Self {
                events: StreamEventStore::new(store.clone(), config.clone()),
                store,
                handlers: Arc::new(HandlerRegistry::new()),
                config,
            }
        }

        fn poller(&self, consumer: &str) -> ConsumerGroupPoller<Arc<InMemoryStreamStore>> {
            ConsumerGroupPoller::new(
                self.store.clone(),
                self.handlers.clone(),
                self.config.clone().with_consumer_name(consumer),
            )
        }

        fn pending(&self) -> u64 {
            self.store
                .pending_summary(&self.config.all_events_key(), &self.config.consumer_group)
                .unwrap()
                .total
        }
    }

    #[test]
    fn delivers_by_type_and_catch_all_then_acks() {
        let fx = Fixture::new();
        let typed = counter(&fx.handlers, Some("horse.registered"));
        let all = counter(&fx.handlers, None);
        let poller = fx.poller("c1");

        poller.tick();
        let id = AggregateId::new();
        fx.events
            .append_batch(
                &[event(id, 1, "horse.registered"), event(id, 2, "horse.sold")],
                id,
                0,
            )
            .unwrap();
        poller.tick();

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(fx.pending(), 0);

        let stats = poller.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.acknowledged, 2);
    }

    #[test]
    fn failing_handler_does_not_block_ack_or_other_handlers() {
        let fx = Fixture::new();
        fx.handlers.register("x", |_| Err(anyhow::anyhow!("handler bug")));
        let all = counter(&fx.handlers, None);
        let poller = fx.poller("c1");

        poller.tick();
        let id = AggregateId::new();
        fx.events.append(&event(id, 1, "x"), id, 0).unwrap();
        poller.tick();

        assert_eq!(all.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pending(), 0);
        assert_eq!(poller.stats().handler_failures, 1);
    }

    #[test]
    fn sentinel_and_malformed_records_are_acked_without_dispatch() {
        let fx = Fixture::new();
        let all = counter(&fx.handlers, None);
        let poller = fx.poller("c1");
        poller.tick();

        let global = fx.config.all_events_key();
        fx.store.append(&global, &EventRecord::init_sentinel()).unwrap();
        let garbage: EventRecord = [("eventType", "x")].into_iter().collect();
        fx.store.append(&global, &garbage).unwrap();
        poller.tick();

        assert_eq!(all.load(Ordering::SeqCst), 0);
        assert_eq!(fx.pending(), 0);
        let stats = poller.stats();
        assert_eq!(stats.sentinels, 1);
        assert_eq!(stats.malformed_records, 1);
        assert_eq!(stats.acknowledged, 2);
    }

    #[test]
    fn missing_group_skips_the_cycle() {
        let fx = Fixture::new();
        let poller = ConsumerGroupPoller::new(
            fx.store.clone(),
            fx.handlers.clone(),
            fx.config.clone().with_create_consumer_group(false),
        );

        assert!(matches!(poller.poll_once(), Err(StoreError::GroupMissing(_))));
        poller.tick();
        assert_eq!(poller.stats().skipped_cycles, 2);
    }

    #[test]
    fn unavailable_store_skips_and_recovers() {
        let fx = Fixture::new();
        let all = counter(&fx.handlers, None);
        let poller = fx.poller("c1");
        poller.tick();

        let id = AggregateId::new();
        fx.events.append(&event(id, 1, "x"), id, 0).unwrap();

        fx.store.set_available(false);
        poller.tick();
        assert_eq!(all.load(Ordering::SeqCst), 0);

        fx.store.set_available(true);
        poller.tick();
        assert_eq!(all.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entries_abandoned_by_a_dead_consumer_are_reclaimed_once() {
        let fx = Fixture::new();
        let all = counter(&fx.handlers, None);
        let live = fx.poller("live");
        live.ensure_group().unwrap();

        let id = AggregateId::new();
        fx.events.append(&event(id, 1, "x"), id, 0).unwrap();

        // "dead" takes delivery and never acknowledges.
        let taken = fx
            .store
            .read_group(&fx.config.all_events_key(), &fx.config.consumer_group, "dead", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(taken.len(), 1);

        live.tick();
        assert_eq!(all.load(Ordering::SeqCst), 0, "not idle long enough yet");

        thread::sleep(Duration::from_millis(300));
        live.tick();
        assert_eq!(all.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pending(), 0);
        assert_eq!(live.stats().claimed, 1);

        live.tick();
        assert_eq!(all.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawned_poller_delivers_until_shutdown() {
        let fx = Fixture::new();
        let all = counter(&fx.handlers, None);
        let config = fx.config.clone().with_poll_interval(Duration::from_millis(5));
        let poller = ConsumerGroupPoller::new(fx.store.clone(), fx.handlers.clone(), config);
        poller.ensure_group().unwrap();
        let handle = poller.spawn().unwrap();

        let id = AggregateId::new();
        fx.events.append(&event(id, 1, "x"), id, 0).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while all.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(all.load(Ordering::SeqCst), 1);
        assert!(handle.stats().ticks > 0);
        handle.shutdown();
    }
}
