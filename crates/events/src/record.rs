//! Flat, string-keyed wire record stored as one stream entry.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Field names of an event record.
pub mod fields {
    pub const EVENT_TYPE: &str = "eventType";
    pub const EVENT_ID: &str = "eventId";
    pub const AGGREGATE_ID: &str = "aggregateId";
    pub const VERSION: &str = "version";
    pub const TIMESTAMP: &str = "timestamp";
    pub const EVENT_DATA: &str = "eventData";

    /// Key (and value) of the bootstrap sentinel entry.
    pub const INIT: &str = "init";
}

/// One stream entry as a flat map of string fields.
///
/// All values are opaque strings; only the serializer interprets them. Field order is
/// deterministic (sorted by key), which keeps encoded entries byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRecord(BTreeMap<String, String>);

impl EventRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `init -> init` entry written only to give an empty stream its first entry,
    /// so a consumer group can be created on it.
    pub fn init_sentinel() -> Self {
        let mut record = Self::new();
        record.insert(fields::INIT, fields::INIT);
        record
    }

    pub fn is_init_sentinel(&self) -> bool {
        self.0.len() == 1 && self.get(fields::INIT) == Some(fields::INIT)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for EventRecord {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

impl From<HashMap<String, String>> for EventRecord {
    fn from(value: HashMap<String, String>) -> Self {
        Self(value.into_iter().collect())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EventRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_recognised_only_in_its_exact_shape() {
        assert!(EventRecord::init_sentinel().is_init_sentinel());

        let mut padded = EventRecord::init_sentinel();
        padded.insert(fields::EVENT_TYPE, "x");
        assert!(!padded.is_init_sentinel());

        let wrong_value: EventRecord = [(fields::INIT, "yes")].into_iter().collect();
        assert!(!wrong_value.is_init_sentinel());
    }
}
