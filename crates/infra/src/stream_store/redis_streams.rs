//! Redis Streams-backed stream store.
//!
//! - **Append**: `XADD key * field value ...`
//! - **Conditional append**: `WATCH key` + `XLEN key` + `MULTI`/`XADD...`/`EXEC`; an
//!   aborted `EXEC` means another writer touched the guarded stream
//! - **Catch-up**: `XRANGE key (cursor + COUNT n` (exclusive cursor)
//! - **Consumer groups**: `XGROUP CREATE key group $`, `XREADGROUP ... >`, `XPENDING`,
//!   `XCLAIM`, `XACK`
//!
//! Every operation opens its own connection from the shared client. Errors are
//! classified by their structured kind and server code, never by message text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadReply,
};
use redis::{Commands, RedisError, Value};
use tracing::{debug, instrument, warn};

use eventlog_events::EventRecord;

use super::{
    ConditionalAppend, EntryId, GroupCreation, LengthGuard, PendingEntry, PendingSummary,
    RangeStart, StoreError, StreamEntry, StreamStore, StreamWrite,
};

#[derive(Debug, Clone)]
pub struct RedisStreamStore {
    client: Arc<redis::Client>,
}

impl RedisStreamStore {
    /// Create a store from a Redis connection URL (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first operation.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| map_redis_error("open client", e))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| map_redis_error("connect", e))
    }
}

fn map_redis_error(operation: &'static str, err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        return StoreError::Unavailable(format!("{operation}: {err}"));
    }

    match err.code() {
        Some("NOGROUP") => StoreError::GroupMissing(format!("{operation}: {err}")),
        _ => StoreError::Command(format!("{operation}: {err}")),
    }
}

/// `BLOCK` argument for a read timeout. Redis treats `BLOCK 0` as "forever", so
/// sub-millisecond timeouts round up to 1.
fn block_millis(block: Duration) -> u64 {
    u64::try_from(block.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

fn xadd_args(cmd: &mut redis::Cmd, key: &str, record: &EventRecord) {
    cmd.arg(key).arg("*");
    for (field, value) in record.iter() {
        cmd.arg(field).arg(value);
    }
}

fn to_entry(stream_id: StreamId) -> StreamEntry {
    let StreamId { id, map } = stream_id;
    StreamEntry {
        id: EntryId::new(id),
        record: record_from_fields(&id_for_logs(&map), map),
    }
}

fn id_for_logs(map: &HashMap<String, Value>) -> String {
    map.get(eventlog_events::fields::EVENT_ID)
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
        .unwrap_or_default()
}

fn record_from_fields(event_id: &str, map: HashMap<String, Value>) -> EventRecord {
    map.into_iter()
        .filter_map(|(field, value)| match redis::from_redis_value::<String>(&value) {
            Ok(value) => Some((field, value)),
            Err(err) => {
                warn!(event_id = %event_id, field = %field, error = %err, "dropping non-string stream field");
                None
            }
        })
        .collect()
}

/// Escape glob metacharacters so `prefix` is matched literally by `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

impl StreamStore for RedisStreamStore {
    #[instrument(skip(self, record), fields(stream_key = %key), err)]
    fn append(&self, key: &str, record: &EventRecord) -> Result<EntryId, StoreError> {
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XADD");
        xadd_args(&mut cmd, key, record);
        let id: String = cmd
            .query(&mut conn)
            .map_err(|e| map_redis_error("XADD", e))?;

        Ok(EntryId::new(id))
    }

    #[instrument(
        skip(self, guard, writes),
        fields(stream_key = %guard.key, expected = guard.expected, writes = writes.len()),
        err
    )]
    fn append_conditional(
        &self,
        guard: LengthGuard<'_>,
        writes: &[StreamWrite<'_>],
    ) -> Result<ConditionalAppend, StoreError> {
        let mut conn = self.connection()?;

        redis::cmd("WATCH")
            .arg(guard.key)
            .query::<()>(&mut conn)
            .map_err(|e| map_redis_error("WATCH", e))?;

        let actual: u64 = redis::cmd("XLEN")
            .arg(guard.key)
            .query(&mut conn)
            .map_err(|e| map_redis_error("XLEN", e))?;

        if actual != guard.expected {
            redis::cmd("UNWATCH")
                .query::<()>(&mut conn)
                .map_err(|e| map_redis_error("UNWATCH", e))?;
            return Ok(ConditionalAppend::LengthMismatch { actual });
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in writes {
            let cmd = pipe.cmd("XADD").arg(write.key).arg("*");
            for (field, value) in write.record.iter() {
                cmd.arg(field).arg(value);
            }
        }

        // EXEC replies nil when the watched key changed after WATCH.
        let committed: Option<Vec<String>> = pipe
            .query(&mut conn)
            .map_err(|e| map_redis_error("MULTI/EXEC", e))?;

        match committed {
            Some(ids) => Ok(ConditionalAppend::Committed(
                ids.into_iter().map(EntryId::new).collect(),
            )),
            None => {
                let actual: u64 = redis::cmd("XLEN")
                    .arg(guard.key)
                    .query(&mut conn)
                    .map_err(|e| map_redis_error("XLEN", e))?;
                debug!(stream_key = %guard.key, actual, "transaction aborted by concurrent writer");
                Ok(ConditionalAppend::LengthMismatch { actual })
            }
        }
    }

    fn stream_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("XLEN")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| map_redis_error("XLEN", e))
    }

    fn range(
        &self,
        key: &str,
        start: &RangeStart,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.connection()?;

        let start = match start {
            RangeStart::First => "-".to_string(),
            RangeStart::After(id) => format!("({id}"),
        };

        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg(start).arg("+");
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }

        let reply: StreamRangeReply = cmd
            .query(&mut conn)
            .map_err(|e| map_redis_error("XRANGE", e))?;

        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", glob_escape(prefix));

        let mut keys: Vec<String> = conn
            .scan_match::<_, String>(pattern)
            .map_err(|e| map_redis_error("SCAN", e))?
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    #[instrument(skip(self), err)]
    fn create_group(&self, key: &str, group: &str) -> Result<GroupCreation, StoreError> {
        let mut conn = self.connection()?;

        let created: Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("$")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(GroupCreation::Created),
            Err(err) if is_busy_group(&err) => Ok(GroupCreation::AlreadyExists),
            Err(err) => Err(map_redis_error("XGROUP CREATE", err)),
        }
    }

    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.connection()?;

        // A BLOCK timeout with nothing to deliver replies nil.
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_millis(block))
            .arg("STREAMS")
            .arg(key)
            .arg(">")
            .query(&mut conn)
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        Ok(reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .filter(|k| k.key == key)
            .flat_map(|k| k.ids)
            .map(to_entry)
            .collect())
    }

    fn pending_summary(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError> {
        let mut conn = self.connection()?;

        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .query(&mut conn)
            .map_err(|e| map_redis_error("XPENDING", e))?;

        Ok(match reply {
            StreamPendingReply::Empty => PendingSummary::default(),
            StreamPendingReply::Data(data) => PendingSummary {
                total: data.count as u64,
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending as u64))
                    .collect(),
            },
        })
    }

    fn pending_entries(
        &self,
        key: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(key).arg(group).arg("-").arg("+").arg(count);
        if let Some(consumer) = consumer {
            cmd.arg(consumer);
        }

        let reply: StreamPendingCountReply = cmd
            .query(&mut conn)
            .map_err(|e| map_redis_error("XPENDING", e))?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: EntryId::new(p.id),
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    #[instrument(skip(self, ids), fields(stream_key = %key, ids = ids.len()), err)]
    fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id.as_str());
        }

        let reply: StreamClaimReply = cmd
            .query(&mut conn)
            .map_err(|e| map_redis_error("XCLAIM", e))?;

        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XACK");
        cmd.arg(key).arg(group);
        for id in ids {
            cmd.arg(id.as_str());
        }

        cmd.query::<u64>(&mut conn)
            .map_err(|e| map_redis_error("XACK", e))
    }
}
