//! Idempotent consumer-group registration.
//!
//! A group can only be created on a stream that exists, and a stream exists only
//! once it has an entry. The global stream is bootstrapped with an `init` sentinel
//! when empty; aggregate streams are never padded (their length is their version),
//! so an empty aggregate stream is skipped until its first event lands.

use serde::Serialize;
use tracing::{debug, info, warn};

use eventlog_events::EventRecord;

use crate::config::EventStoreConfig;
use crate::stream_store::{GroupCreation, StoreError, StreamStore};

/// Outcome of registering the group on one stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum GroupRegistration {
    Created,
    AlreadyExists,
    /// The stream has no entries and was not bootstrapped.
    SkippedEmpty,
}

/// Per-stream outcomes of [`ConsumerGroupRegistrar::register_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    pub created: Vec<String>,
    pub already_existed: Vec<String>,
    pub skipped_empty: Vec<String>,
    pub failed: Vec<(String, StoreError)>,
}

impl RegistrationReport {
    fn record(&mut self, key: String, outcome: Result<GroupRegistration, StoreError>) {
        match outcome {
            Ok(GroupRegistration::Created) => self.created.push(key),
            Ok(GroupRegistration::AlreadyExists) => self.already_existed.push(key),
            Ok(GroupRegistration::SkippedEmpty) => self.skipped_empty.push(key),
            Err(err) => self.failed.push((key, err)),
        }
    }
}

/// Creates the configured consumer group, positioned at the latest entry, on event streams.
///
/// Safe to run repeatedly and from several instances at once: "already exists" is success.
#[derive(Debug, Clone)]
pub struct ConsumerGroupRegistrar<S> {
    store: S,
    config: EventStoreConfig,
}

impl<S> ConsumerGroupRegistrar<S>
where
    S: StreamStore,
{
    pub fn new(store: S, config: EventStoreConfig) -> Self {
        Self { store, config }
    }

    /// Register the group on `key`, appending the bootstrap sentinel first if
    /// `bootstrap` is set and the stream is empty.
    pub fn ensure_group(&self, key: &str, bootstrap: bool) -> Result<GroupRegistration, StoreError> {
        let group = &self.config.consumer_group;

        if self.store.stream_len(key)? == 0 {
            if !bootstrap {
                debug!(stream_key = %key, "stream is empty, group registration deferred");
                return Ok(GroupRegistration::SkippedEmpty);
            }
            self.store.append(key, &EventRecord::init_sentinel())?;
            debug!(stream_key = %key, "bootstrapped empty stream");
        }

        match self.store.create_group(key, group)? {
            GroupCreation::Created => {
                info!(stream_key = %key, group = %group, "consumer group created");
                Ok(GroupRegistration::Created)
            }
            GroupCreation::AlreadyExists => {
                debug!(stream_key = %key, group = %group, "consumer group already exists");
                Ok(GroupRegistration::AlreadyExists)
            }
        }
    }

    /// Register the group on the global stream, bootstrapping it if empty.
    pub fn register_global(&self) -> Result<GroupRegistration, StoreError> {
        self.ensure_group(&self.config.all_events_key(), true)
    }

    /// Register the group on the global stream and on every existing aggregate stream.
    ///
    /// Only a failure on the global stream is returned as an error; per-aggregate
    /// failures are logged and listed in the report.
    pub fn register_all(&self) -> Result<RegistrationReport, StoreError> {
        let global = self.config.all_events_key();
        let mut report = RegistrationReport::default();

        let outcome = self.register_global()?;
        report.record(global.clone(), Ok(outcome));

        for key in self.store.keys(&self.config.stream_prefix)? {
            if key == global {
                continue;
            }
            let outcome = self.ensure_group(&key, false);
            if let Err(err) = &outcome {
                warn!(stream_key = %key, error = %err, "failed to register consumer group");
            }
            report.record(key, outcome);
        }

        info!(
            created = report.created.len(),
            already_existed = report.already_existed.len(),
            failed = report.failed.len(),
            "consumer group registration finished"
        );
        Ok(report)
    }
}
