//! Domain events, their flat wire record, and in-process handler registration.
//!
//! Nothing here talks to a backing store: the record shape and the serializer port
//! are the contract the infrastructure layer writes and reads.

pub mod event;
pub mod handler;
pub mod record;
pub mod serializer;

pub use event::{DomainEvent, Event};
pub use handler::{DispatchReport, EventHandler, HandlerFailure, HandlerId, HandlerRegistry, Subscription};
pub use record::{EventRecord, fields};
pub use serializer::{EventSerializer, JsonEventSerializer, SerializationError};
