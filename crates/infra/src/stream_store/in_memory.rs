use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use eventlog_events::EventRecord;

use super::{
    ConditionalAppend, EntryId, GroupCreation, LengthGuard, PendingEntry, PendingSummary,
    RangeStart, StoreError, StreamEntry, StreamStore, StreamWrite,
};

#[derive(Debug)]
struct StoredEntry {
    seq: u64,
    id: EntryId,
    record: EventRecord,
}

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct Group {
    /// Sequence number of the last entry handed out by `read_group`.
    last_delivered: u64,
    pending: BTreeMap<u64, PendingState>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn last_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq).unwrap_or(0)
    }

    fn entry(&self, seq: u64) -> Option<&StoredEntry> {
        self.entries
            .binary_search_by_key(&seq, |e| e.seq)
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    streams: HashMap<String, Stream>,
}

impl State {
    fn push(&mut self, key: &str, record: &EventRecord) -> EntryId {
        self.next_seq += 1;
        let seq = self.next_seq;
        let id = EntryId::new(format!("{seq}-0"));
        self.streams.entry(key.to_string()).or_default().entries.push(StoredEntry {
            seq,
            id: id.clone(),
            record: record.clone(),
        });
        id
    }

    fn group_mut(&mut self, key: &str, group: &str) -> Result<(&mut Stream, u64), StoreError> {
        let stream = self
            .streams
            .get_mut(key)
            .ok_or_else(|| no_group(key, group))?;
        if !stream.groups.contains_key(group) {
            return Err(no_group(key, group));
        }
        let last = stream.last_seq();
        Ok((stream, last))
    }
}

fn no_group(key: &str, group: &str) -> StoreError {
    StoreError::GroupMissing(format!("NOGROUP no such key '{key}' or consumer group '{group}'"))
}

fn seq_of(id: &EntryId) -> Option<u64> {
    id.as_str().split('-').next()?.parse().ok()
}

fn to_entry(stored: &StoredEntry) -> StreamEntry {
    StreamEntry {
        id: stored.id.clone(),
        record: stored.record.clone(),
    }
}

/// In-memory stream store with consumer-group semantics.
///
/// Intended for tests/dev. Entry ids are `<global sequence>-0`, so ids are unique
/// across streams and increase in append order. Blocking reads return immediately.
/// `set_available(false)` makes every operation fail with [`StoreError::Unavailable`],
/// which is how tests simulate an unreachable store.
#[derive(Debug)]
pub struct InMemoryStreamStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Command("lock poisoned".to_string()))
    }
}

impl StreamStore for InMemoryStreamStore {
    fn append(&self, key: &str, record: &EventRecord) -> Result<EntryId, StoreError> {
        Ok(self.state()?.push(key, record))
    }

    fn append_conditional(
        &self,
        guard: LengthGuard<'_>,
        writes: &[StreamWrite<'_>],
    ) -> Result<ConditionalAppend, StoreError> {
        let mut state = self.state()?;

        let actual = state
            .streams
            .get(guard.key)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0);
        if actual != guard.expected {
            return Ok(ConditionalAppend::LengthMismatch { actual });
        }

        let ids = writes.iter().map(|w| state.push(w.key, w.record)).collect();
        Ok(ConditionalAppend::Committed(ids))
    }

    fn stream_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .state()?
            .streams
            .get(key)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    fn range(
        &self,
        key: &str,
        start: &RangeStart,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let state = self.state()?;
        let Some(stream) = state.streams.get(key) else {
            return Ok(vec![]);
        };

        let after = match start {
            RangeStart::First => 0,
            RangeStart::After(id) => seq_of(id)
                .ok_or_else(|| StoreError::Command(format!("invalid stream id '{id}'")))?,
        };

        Ok(stream
            .entries
            .iter()
            .filter(|e| e.seq > after)
            .take(count.unwrap_or(usize::MAX))
            .map(to_entry)
            .collect())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .state()?
            .streams
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn create_group(&self, key: &str, group: &str) -> Result<GroupCreation, StoreError> {
        let mut state = self.state()?;
        let stream = state.streams.get_mut(key).ok_or_else(|| {
            StoreError::Command(format!("stream '{key}' must exist before creating a group"))
        })?;

        if stream.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = stream.last_seq();
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut state = self.state()?;
        let (stream, _) = state.group_mut(key, group)?;
        let Stream { entries, groups } = stream;
        let Some(g) = groups.get_mut(group) else {
            return Err(no_group(key, group));
        };

        let now = Instant::now();
        let after = g.last_delivered;
        let mut delivered = Vec::new();
        for stored in entries.iter().filter(|e| e.seq > after).take(count) {
            g.last_delivered = stored.seq;
            g.pending.insert(
                stored.seq,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            delivered.push(to_entry(stored));
        }
        Ok(delivered)
    }

    fn pending_summary(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError> {
        let mut state = self.state()?;
        let (stream, _) = state.group_mut(key, group)?;
        let Some(g) = stream.groups.get(group) else {
            return Err(no_group(key, group));
        };

        let mut per_consumer: BTreeMap<&str, u64> = BTreeMap::new();
        for p in g.pending.values() {
            *per_consumer.entry(p.consumer.as_str()).or_default() += 1;
        }

        Ok(PendingSummary {
            total: g.pending.len() as u64,
            consumers: per_consumer
                .into_iter()
                .map(|(c, n)| (c.to_string(), n))
                .collect(),
        })
    }

    fn pending_entries(
        &self,
        key: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut state = self.state()?;
        let (stream, _) = state.group_mut(key, group)?;
        let Some(g) = stream.groups.get(group) else {
            return Err(no_group(key, group));
        };

        let now = Instant::now();
        Ok(g.pending
            .iter()
            .filter(|(_, p)| consumer.is_none_or(|c| p.consumer == c))
            .take(count)
            .map(|(seq, p)| PendingEntry {
                id: EntryId::new(format!("{seq}-0")),
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut state = self.state()?;
        let (stream, _) = state.group_mut(key, group)?;
        let Stream { entries: _, groups } = &mut *stream;
        let Some(g) = groups.get_mut(group) else {
            return Err(no_group(key, group));
        };

        let now = Instant::now();
        let mut claimed_seqs = Vec::new();
        for seq in ids.iter().filter_map(seq_of) {
            let Some(p) = g.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(p.delivered_at) < min_idle {
                continue;
            }
            p.consumer = consumer.to_string();
            p.delivered_at = now;
            p.delivery_count += 1;
            claimed_seqs.push(seq);
        }

        Ok(claimed_seqs
            .into_iter()
            .filter_map(|seq| stream.entry(seq).map(to_entry))
            .collect())
    }

    fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let Some(g) = state
            .streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        Ok(ids
            .iter()
            .filter_map(seq_of)
            .filter(|seq| g.pending.remove(seq).is_some())
            .count() as u64)
    }
}
