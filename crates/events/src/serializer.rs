//! Serializer port between [`DomainEvent`] and the flat [`EventRecord`].

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use eventlog_core::{AggregateId, EventId};

use crate::event::DomainEvent;
use crate::record::{EventRecord, fields};

/// A record could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SerializationError {
    fn invalid(field: &'static str, reason: impl ToString) -> Self {
        Self::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Converts domain events to and from stream records.
///
/// Implementations must be deterministic: the same event always encodes to the same
/// record, and `deserialize(serialize(e)) == e`.
pub trait EventSerializer: Send + Sync {
    fn serialize(&self, event: &DomainEvent) -> Result<EventRecord, SerializationError>;

    fn deserialize(&self, record: &EventRecord) -> Result<DomainEvent, SerializationError>;

    /// Routing tag of a record, read without decoding the payload.
    fn event_type<'a>(&self, record: &'a EventRecord) -> Result<&'a str, SerializationError> {
        record
            .get(fields::EVENT_TYPE)
            .ok_or(SerializationError::MissingField(fields::EVENT_TYPE))
    }
}

impl<S> EventSerializer for Arc<S>
where
    S: EventSerializer + ?Sized,
{
    fn serialize(&self, event: &DomainEvent) -> Result<EventRecord, SerializationError> {
        (**self).serialize(event)
    }

    fn deserialize(&self, record: &EventRecord) -> Result<DomainEvent, SerializationError> {
        (**self).deserialize(record)
    }

    fn event_type<'a>(&self, record: &'a EventRecord) -> Result<&'a str, SerializationError> {
        (**self).event_type(record)
    }
}

/// JSON serializer: metadata as plain fields, payload as a JSON string in `eventData`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

impl JsonEventSerializer {
    pub fn new() -> Self {
        Self
    }
}

fn required<'a>(record: &'a EventRecord, field: &'static str) -> Result<&'a str, SerializationError> {
    record.get(field).ok_or(SerializationError::MissingField(field))
}

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, event: &DomainEvent) -> Result<EventRecord, SerializationError> {
        let event_data = serde_json::to_string(event.payload())?;

        let mut record = EventRecord::new();
        record.insert(fields::EVENT_TYPE, event.event_type());
        record.insert(fields::EVENT_ID, event.event_id().to_string());
        record.insert(fields::AGGREGATE_ID, event.aggregate_id().to_string());
        record.insert(fields::VERSION, event.version().to_string());
        record.insert(
            fields::TIMESTAMP,
            event.timestamp().to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
        record.insert(fields::EVENT_DATA, event_data);
        Ok(record)
    }

    fn deserialize(&self, record: &EventRecord) -> Result<DomainEvent, SerializationError> {
        let event_type = required(record, fields::EVENT_TYPE)?;
        if event_type.is_empty() {
            return Err(SerializationError::invalid(fields::EVENT_TYPE, "empty"));
        }

        let event_id: EventId = required(record, fields::EVENT_ID)?
            .parse()
            .map_err(|e| SerializationError::invalid(fields::EVENT_ID, e))?;
        let aggregate_id: AggregateId = required(record, fields::AGGREGATE_ID)?
            .parse()
            .map_err(|e| SerializationError::invalid(fields::AGGREGATE_ID, e))?;

        let version: u64 = required(record, fields::VERSION)?
            .parse()
            .map_err(|e| SerializationError::invalid(fields::VERSION, e))?;
        if version == 0 {
            return Err(SerializationError::invalid(fields::VERSION, "versions start at 1"));
        }

        let timestamp = DateTime::parse_from_rfc3339(required(record, fields::TIMESTAMP)?)
            .map_err(|e| SerializationError::invalid(fields::TIMESTAMP, e))?
            .with_timezone(&Utc);

        let payload = serde_json::from_str(required(record, fields::EVENT_DATA)?)?;

        Ok(DomainEvent::new(
            event_id,
            aggregate_id,
            version,
            timestamp,
            event_type,
            payload,
        ))
    }
}
