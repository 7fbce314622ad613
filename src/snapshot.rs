//! Last known-good collections and the recent pin value map.

use crate::models::{CacheEntry, Collection};
use crate::store::PersistentStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const LAST_SYNC_KEY: &str = "last_sync";
pub const RECENT_PIN_VALUES_KEY: &str = "recent_pin_values";

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    store: PersistentStore,
    freshness: Duration,
}

impl SnapshotCache {
    pub fn new(store: PersistentStore, freshness: Duration) -> Self {
        Self { store, freshness }
    }

    /// Replaces the whole collection and bumps the shared last-sync timestamp.
    pub fn store<T: Serialize>(&self, collection: Collection, items: &[T]) -> bool {
        let now = Utc::now();
        let entry = CacheEntry {
            key: collection.as_str().to_string(),
            value: items,
            written_at: now,
        };
        let saved = self.store.save(collection.as_str(), &entry);
        if saved {
            self.store.save(LAST_SYNC_KEY, &now);
            tracing::debug!(collection = collection.as_str(), items = items.len(), "snapshot stored");
        }
        saved
    }

    /// Empty on a miss or an undecodable snapshot.
    pub fn get_cached<T: DeserializeOwned>(&self, collection: Collection) -> Vec<T> {
        self.entry::<T>(collection).map(|entry| entry.value).unwrap_or_default()
    }

    pub fn entry<T: DeserializeOwned>(&self, collection: Collection) -> Option<CacheEntry<Vec<T>>> {
        self.store.load(collection.as_str())
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.store.load(LAST_SYNC_KEY)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_within(self.freshness)
    }

    pub fn is_fresh_within(&self, max_age: Duration) -> bool {
        let Some(last_synced) = self.last_synced() else {
            return false;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return true;
        };
        Utc::now().signed_duration_since(last_synced) <= max_age
    }

    pub fn invalidate(&self, collection: Collection) {
        self.store.remove(collection.as_str());
        tracing::debug!(collection = collection.as_str(), "snapshot invalidated");
    }

    pub fn clear(&self) {
        for collection in Collection::ALL {
            self.store.remove(collection.as_str());
        }
        self.store.remove(LAST_SYNC_KEY);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentPinValue {
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Bounded `pin_id -> latest value` map; the oldest timestamps go first.
#[derive(Debug, Clone)]
pub struct RecentPinValues {
    store: PersistentStore,
    cap: usize,
}

impl RecentPinValues {
    pub fn new(store: PersistentStore, cap: usize) -> Self {
        Self { store, cap }
    }

    pub fn record(&self, pin_id: &str, value: serde_json::Value) -> bool {
        self.record_at(pin_id, value, Utc::now())
    }

    pub fn record_at(&self, pin_id: &str, value: serde_json::Value, timestamp: DateTime<Utc>) -> bool {
        let mut values = self.all();
        values.insert(pin_id.to_string(), RecentPinValue { value, timestamp });
        while values.len() > self.cap {
            let oldest = values
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(pin_id, _)| pin_id.clone());
            match oldest {
                Some(pin_id) => {
                    values.remove(&pin_id);
                }
                None => break,
            }
        }
        self.store.save(RECENT_PIN_VALUES_KEY, &values)
    }

    pub fn get(&self, pin_id: &str) -> Option<RecentPinValue> {
        self.all().remove(pin_id)
    }

    pub fn all(&self) -> BTreeMap<String, RecentPinValue> {
        self.store.load(RECENT_PIN_VALUES_KEY).unwrap_or_default()
    }

    pub fn clear(&self) {
        self.store.remove(RECENT_PIN_VALUES_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::{RecentPinValues, SnapshotCache, LAST_SYNC_KEY};
    use crate::models::{Collection, Device};
    use crate::store::PersistentStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            project_id: "proj-1".to_string(),
            name: format!("device {}", id),
            status: Some("online".to_string()),
            last_seen: None,
        }
    }

    #[test]
    fn repeated_reads_are_identical() {
        let cache = SnapshotCache::new(PersistentStore::in_memory(64 * 1024), Duration::from_secs(3_600));
        cache.store(Collection::Devices, &[device("d1"), device("d2")]);

        let first: Vec<Device> = cache.get_cached(Collection::Devices);
        let second: Vec<Device> = cache.get_cached(Collection::Devices);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn misses_yield_empty_collections() {
        let cache = SnapshotCache::new(PersistentStore::in_memory(64 * 1024), Duration::from_secs(3_600));
        assert!(cache.get_cached::<Device>(Collection::Pins).is_empty());
        assert!(!cache.is_fresh());
    }

    #[test]
    fn freshness_follows_last_sync() {
        let store = PersistentStore::in_memory(64 * 1024);
        let cache = SnapshotCache::new(store.clone(), Duration::from_secs(3_600));
        cache.store(Collection::Projects, &[json!({ "id": "p1", "name": "Greenhouse" })]);
        assert!(cache.is_fresh());

        store.save(LAST_SYNC_KEY, &(Utc::now() - chrono::Duration::hours(2)));
        assert!(!cache.is_fresh());
        assert!(cache.is_fresh_within(Duration::from_secs(3 * 3_600)));
    }

    #[test]
    fn invalidate_is_scoped_and_clear_is_total() {
        let cache = SnapshotCache::new(PersistentStore::in_memory(64 * 1024), Duration::from_secs(3_600));
        cache.store(Collection::Devices, &[device("d1")]);
        cache.store(Collection::Pins, &[json!({ "id": "pin-1" })]);

        cache.invalidate(Collection::Devices);
        assert!(cache.get_cached::<Device>(Collection::Devices).is_empty());
        assert_eq!(cache.get_cached::<serde_json::Value>(Collection::Pins).len(), 1);

        cache.clear();
        assert!(cache.get_cached::<serde_json::Value>(Collection::Pins).is_empty());
        assert!(cache.last_synced().is_none());
    }

    #[test]
    fn recent_pin_values_evict_oldest_timestamp() {
        let values = RecentPinValues::new(PersistentStore::in_memory(256 * 1024), 50);
        let start = Utc::now() - chrono::Duration::minutes(10);
        for index in 0..50 {
            values.record_at(&format!("pin-{:02}", index), json!(index), start + chrono::Duration::seconds(index));
        }
        values.record_at("pin-00", json!("refreshed"), Utc::now());
        values.record("pin-new", json!(true));

        let all = values.all();
        assert_eq!(all.len(), 50);
        assert!(all.contains_key("pin-00"));
        assert!(!all.contains_key("pin-01"));
        assert_eq!(values.get("pin-new").map(|entry| entry.value), Some(json!(true)));
    }
}
