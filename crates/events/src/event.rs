use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventlog_core::{AggregateId, EventId};

use crate::serializer::SerializationError;

/// A typed domain event produced by business code.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **tagged** with a stable type name used for routing
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "member.registered").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// An immutable fact recorded in exactly one aggregate stream.
///
/// `version` is the 1-based position of the event in its aggregate stream. The
/// append engine checks it against the stream's committed version, so producers
/// must set it to `last observed version + 1` (or a contiguous run for batches).
///
/// The payload is opaque to the event log: it is carried as JSON and only typed
/// again by consumers through [`DomainEvent::payload_as`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: EventId,
    aggregate_id: AggregateId,
    version: u64,
    timestamp: DateTime<Utc>,
    event_type: String,
    payload: JsonValue,
}

impl DomainEvent {
    pub fn new(
        event_id: EventId,
        aggregate_id: AggregateId,
        version: u64,
        timestamp: DateTime<Utc>,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            version,
            timestamp,
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build an event from a typed payload.
    ///
    /// Takes the type tag and timestamp from the [`Event`] impl and assigns a fresh
    /// [`EventId`].
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        version: u64,
        event: &E,
    ) -> Result<Self, SerializationError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(
            EventId::new(),
            aggregate_id,
            version,
            event.occurred_at(),
            event.event_type(),
            payload,
        ))
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the opaque payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Return a copy positioned at `version`.
    ///
    /// Producers use this to re-stamp an event after re-reading the stream on conflict.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MemberRegistered {
        name: String,
        occurred_at: DateTime<Utc>,
    }

    impl Event for MemberRegistered {
        fn event_type(&self) -> &'static str {
            "member.registered"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    #[test]
    fn from_typed_captures_tag_timestamp_and_payload() {
        let aggregate_id = AggregateId::new();
        let typed = MemberRegistered {
            name: "Anna".to_string(),
            occurred_at: Utc::now(),
        };

        let event = DomainEvent::from_typed(aggregate_id, 1, &typed).unwrap();

        assert_eq!(event.aggregate_id(), aggregate_id);
        assert_eq!(event.version(), 1);
        assert_eq!(event.event_type(), "member.registered");
        assert_eq!(event.timestamp(), typed.occurred_at);
        assert_eq!(event.payload_as::<MemberRegistered>().unwrap(), typed);
    }

    #[test]
    fn with_version_keeps_identity() {
        let event = DomainEvent::new(
            EventId::new(),
            AggregateId::new(),
            1,
            Utc::now(),
            "horse.added",
            serde_json::json!({}),
        );
        let id = event.event_id();

        let moved = event.with_version(4);
        assert_eq!(moved.version(), 4);
        assert_eq!(moved.event_id(), id);
    }
}
