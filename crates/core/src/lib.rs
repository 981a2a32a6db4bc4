//! `eventlog-core`: identifiers and error primitives shared by every layer.
//!
//! This crate has no infrastructure concerns and no knowledge of the backing store.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{AggregateId, EventId};
