//! Event log configuration: store location, key naming, consumer identity and timing.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use eventlog_core::AggregateId;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_STREAM_PREFIX: &str = "event-stream:";
pub const DEFAULT_ALL_EVENTS_STREAM: &str = "all-events";
pub const DEFAULT_CONSUMER_GROUP: &str = "event-processors";
pub const DEFAULT_CONSUMER_NAME: &str = "event-consumer";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_CLAIM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Group reads block in whole milliseconds.
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

const ENV_REDIS_URL: &str = "EVENTLOG_REDIS_URL";
const ENV_STREAM_PREFIX: &str = "EVENTLOG_STREAM_PREFIX";
const ENV_ALL_EVENTS_STREAM: &str = "EVENTLOG_ALL_EVENTS_STREAM";
const ENV_CONSUMER_GROUP: &str = "EVENTLOG_CONSUMER_GROUP";
const ENV_CONSUMER_NAME: &str = "EVENTLOG_CONSUMER_NAME";
const ENV_MAX_BATCH_SIZE: &str = "EVENTLOG_MAX_BATCH_SIZE";
const ENV_POLL_TIMEOUT_MS: &str = "EVENTLOG_POLL_TIMEOUT_MS";
const ENV_CLAIM_IDLE_TIMEOUT_MS: &str = "EVENTLOG_CLAIM_IDLE_TIMEOUT_MS";
const ENV_POLL_INTERVAL_MS: &str = "EVENTLOG_POLL_INTERVAL_MS";
const ENV_CREATE_CONSUMER_GROUP: &str = "EVENTLOG_CREATE_CONSUMER_GROUP";
const ENV_METRICS_REPORT_INTERVAL_MS: &str = "EVENTLOG_METRICS_REPORT_INTERVAL_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Event log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventStoreConfig {
    pub redis_url: String,
    /// Prepended to every stream key.
    pub stream_prefix: String,
    /// Name (without prefix) of the global stream.
    pub all_events_stream: String,
    pub consumer_group: String,
    /// This instance's consumer name within the group.
    pub consumer_name: String,
    /// Upper bound on entries per poll, per reclaim, and per catch-up chunk.
    pub max_batch_size: usize,
    /// Block timeout of one group read.
    pub poll_timeout: Duration,
    /// Pending entries idle at least this long are reclaimed.
    pub claim_idle_timeout: Duration,
    /// Fixed delay between poller ticks.
    pub poll_interval: Duration,
    pub create_consumer_group_if_not_exists: bool,
    pub metrics_report_interval: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            all_events_stream: DEFAULT_ALL_EVENTS_STREAM.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            claim_idle_timeout: DEFAULT_CLAIM_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            create_consumer_group_if_not_exists: true,
            metrics_report_interval: DEFAULT_METRICS_REPORT_INTERVAL,
        }
    }
}

impl EventStoreConfig {
    /// Defaults overridden by any `EVENTLOG_*` environment variables that are set.
    ///
    /// Durations are given in milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_REDIS_URL) {
            config.redis_url = v;
        }
        if let Some(v) = lookup(ENV_STREAM_PREFIX) {
            config.stream_prefix = v;
        }
        if let Some(v) = lookup(ENV_ALL_EVENTS_STREAM) {
            config.all_events_stream = v;
        }
        if let Some(v) = lookup(ENV_CONSUMER_GROUP) {
            config.consumer_group = v;
        }
        if let Some(v) = lookup(ENV_CONSUMER_NAME) {
            config.consumer_name = v;
        }
        if let Some(v) = lookup(ENV_MAX_BATCH_SIZE) {
            config.max_batch_size = parse(ENV_MAX_BATCH_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_TIMEOUT_MS) {
            config.poll_timeout = Duration::from_millis(parse(ENV_POLL_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_CLAIM_IDLE_TIMEOUT_MS) {
            config.claim_idle_timeout = Duration::from_millis(parse(ENV_CLAIM_IDLE_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse(ENV_POLL_INTERVAL_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_CREATE_CONSUMER_GROUP) {
            config.create_consumer_group_if_not_exists = parse(ENV_CREATE_CONSUMER_GROUP, &v)?;
        }
        if let Some(v) = lookup(ENV_METRICS_REPORT_INTERVAL_MS) {
            config.metrics_report_interval =
                Duration::from_millis(parse(ENV_METRICS_REPORT_INTERVAL_MS, &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("redis_url", &self.redis_url),
            ("all_events_stream", &self.all_events_stream),
            ("consumer_group", &self.consumer_group),
            ("consumer_name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be at least 1".to_string()));
        }
        if self.poll_timeout < MIN_POLL_TIMEOUT {
            return Err(ConfigError::Invalid("poll_timeout must be at least 1ms".to_string()));
        }
        if self.metrics_report_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics_report_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Key of the private stream of one aggregate.
    pub fn stream_key(&self, aggregate_id: AggregateId) -> String {
        format!("{}{}", self.stream_prefix, aggregate_id)
    }

    /// Key of the global stream.
    pub fn all_events_key(&self) -> String {
        format!("{}{}", self.stream_prefix, self.all_events_stream)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    pub fn with_all_events_stream(mut self, name: impl Into<String>) -> Self {
        self.all_events_stream = name.into();
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_claim_idle_timeout(mut self, timeout: Duration) -> Self {
        self.claim_idle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_create_consumer_group(mut self, create: bool) -> Self {
        self.create_consumer_group_if_not_exists = create;
        self
    }

    pub fn with_metrics_report_interval(mut self, interval: Duration) -> Self {
        self.metrics_report_interval = interval;
        self
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        reason: format!("'{raw}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_derive_keys_from_prefix() {
        let config = EventStoreConfig::default();
        let id = AggregateId::new();

        assert_eq!(config.all_events_key(), "event-stream:all-events");
        assert_eq!(config.stream_key(id), format!("event-stream:{id}"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = EventStoreConfig::from_lookup(lookup(&[
            ("EVENTLOG_CONSUMER_NAME", "node-2"),
            ("EVENTLOG_MAX_BATCH_SIZE", "25"),
            ("EVENTLOG_CLAIM_IDLE_TIMEOUT_MS", "1500"),
            ("EVENTLOG_CREATE_CONSUMER_GROUP", "false"),
        ]))
        .unwrap();

        assert_eq!(config.consumer_name, "node-2");
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.claim_idle_timeout, Duration::from_millis(1500));
        assert!(!config.create_consumer_group_if_not_exists);
        assert_eq!(config.consumer_group, DEFAULT_CONSUMER_GROUP);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = EventStoreConfig::from_lookup(lookup(&[("EVENTLOG_POLL_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "EVENTLOG_POLL_TIMEOUT_MS", .. }));
    }

    #[test]
    fn sub_millisecond_poll_timeout_is_rejected() {
        for timeout in [Duration::ZERO, Duration::from_micros(500)] {
            let err = EventStoreConfig::default()
                .with_poll_timeout(timeout)
                .validate()
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
        }
        assert!(EventStoreConfig::default()
            .with_poll_timeout(MIN_POLL_TIMEOUT)
            .validate()
            .is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = EventStoreConfig::default()
            .with_max_batch_size(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
