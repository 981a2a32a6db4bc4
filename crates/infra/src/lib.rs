//! Infrastructure layer: backing stream store, event store, consumer groups, config.

pub mod config;
pub mod consumer;
pub mod event_store;
pub mod stream_store;


pub use config::{ConfigError, EventStoreConfig};
