//! Append-only event store with per-aggregate optimistic concurrency.
//!
//! [`StreamEventStore`] implements [`EventStore`] over any [`crate::stream_store::StreamStore`].

pub mod metrics;
pub mod query;
pub mod stream_event_store;
pub mod r#trait;
pub mod version_cache;

pub use metrics::{AppendKind, EventStoreMetrics, MetricsSnapshot};
pub use query::{AllEventsPage, GlobalPosition};
pub use r#trait::{EventStore, EventStoreError};
pub use stream_event_store::StreamEventStore;
pub use version_cache::VersionCache;
