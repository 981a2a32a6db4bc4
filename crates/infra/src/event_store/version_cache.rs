//! Soft, per-aggregate cache of the last committed stream version.

use dashmap::DashMap;

use eventlog_core::AggregateId;

/// Concurrent map of aggregate id to last known committed version.
///
/// Entries are hints, never authority: any entry may be dropped at any time and
/// the next access re-derives it from the store. Each read and write is atomic per
/// key; no lock is held across store I/O.
#[derive(Debug, Default)]
pub struct VersionCache {
    versions: DashMap<AggregateId, u64>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, aggregate_id: AggregateId) -> Option<u64> {
        self.versions.get(&aggregate_id).map(|v| *v)
    }

    pub fn set(&self, aggregate_id: AggregateId, version: u64) {
        self.versions.insert(aggregate_id, version);
    }

    pub fn invalidate(&self, aggregate_id: AggregateId) {
        self.versions.remove(&aggregate_id);
    }

    pub fn clear(&self) {
        self.versions.clear();
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_invalidate() {
        let cache = VersionCache::new();
        let id = AggregateId::new();

        assert_eq!(cache.get(id), None);
        cache.set(id, 3);
        assert_eq!(cache.get(id), Some(3));
        cache.set(id, 4);
        assert_eq!(cache.get(id), Some(4));

        cache.invalidate(id);
        assert_eq!(cache.get(id), None);
        assert!(cache.is_empty());
    }
}
