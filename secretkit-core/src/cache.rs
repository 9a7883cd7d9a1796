//! In-memory derived-key cache with relock timers.
//!
//! Two disjoint maps: collection name to derived key, and hashed
//! standalone secret name to derived key. The cache is consulted only in
//! the split strategy; encrypted-storage plugins track their own lock
//! state. A key sits in the cache iff the item is logically unlocked.

use std::collections::HashMap;

use log::debug;
use tokio::task::JoinHandle;

use crate::key::DerivedKey;

struct CacheEntry {
    key: DerivedKey,
    relock_timer: Option<JoinHandle<()>>,
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.relock_timer.take() {
            timer.abort();
        }
    }
}

/// The derived-key cache. Mutated only under the processor's lock.
#[derive(Default)]
pub(crate) struct KeyCache {
    collection_keys: HashMap<String, CacheEntry>,
    standalone_keys: HashMap<String, CacheEntry>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    // Collections

    pub fn contains_collection(&self, collection_name: &str) -> bool {
        self.collection_keys.contains_key(collection_name)
    }

    pub fn collection_key(&self, collection_name: &str) -> Option<DerivedKey> {
        self.collection_keys
            .get(collection_name)
            .map(|entry| entry.key.clone())
    }

    /// Inserts a collection key if absent, keeping any armed timer.
    pub fn insert_collection_key(&mut self, collection_name: &str, key: DerivedKey) {
        self.collection_keys
            .entry(collection_name.to_string())
            .or_insert(CacheEntry {
                key,
                relock_timer: None,
            });
    }

    /// Removes a collection's key and cancels its relock timer.
    pub fn remove_collection(&mut self, collection_name: &str) {
        if self.collection_keys.remove(collection_name).is_some() {
            debug!("evicted cached key for collection {collection_name}");
        }
    }

    pub fn has_collection_timer(&self, collection_name: &str) -> bool {
        self.collection_keys
            .get(collection_name)
            .is_some_and(|entry| entry.relock_timer.is_some())
    }

    /// Attaches a relock timer to a cached collection key. The caller
    /// arms at most one timer per entry.
    pub fn set_collection_timer(&mut self, collection_name: &str, timer: JoinHandle<()>) {
        if let Some(entry) = self.collection_keys.get_mut(collection_name) {
            debug_assert!(entry.relock_timer.is_none());
            entry.relock_timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Names of all collections with cached keys.
    pub fn cached_collection_names(&self) -> Vec<String> {
        self.collection_keys.keys().cloned().collect()
    }

    // Standalone secrets (keyed by hashed name)

    pub fn contains_standalone(&self, hashed_secret_name: &str) -> bool {
        self.standalone_keys.contains_key(hashed_secret_name)
    }

    pub fn standalone_key(&self, hashed_secret_name: &str) -> Option<DerivedKey> {
        self.standalone_keys
            .get(hashed_secret_name)
            .map(|entry| entry.key.clone())
    }

    pub fn insert_standalone_key(&mut self, hashed_secret_name: &str, key: DerivedKey) {
        self.standalone_keys
            .entry(hashed_secret_name.to_string())
            .or_insert(CacheEntry {
                key,
                relock_timer: None,
            });
    }

    pub fn remove_standalone(&mut self, hashed_secret_name: &str) {
        if self.standalone_keys.remove(hashed_secret_name).is_some() {
            debug!("evicted cached key for standalone secret {hashed_secret_name}");
        }
    }

    pub fn has_standalone_timer(&self, hashed_secret_name: &str) -> bool {
        self.standalone_keys
            .get(hashed_secret_name)
            .is_some_and(|entry| entry.relock_timer.is_some())
    }

    pub fn set_standalone_timer(&mut self, hashed_secret_name: &str, timer: JoinHandle<()>) {
        if let Some(entry) = self.standalone_keys.get_mut(hashed_secret_name) {
            debug_assert!(entry.relock_timer.is_none());
            entry.relock_timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Hashed names of all standalone secrets with cached keys.
    pub fn cached_standalone_names(&self) -> Vec<String> {
        self.standalone_keys.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> DerivedKey {
        DerivedKey::from_bytes(vec![byte; 32])
    }

    #[test]
    fn test_collection_key_lifecycle() {
        let mut cache = KeyCache::new();
        assert!(!cache.contains_collection("c"));
        cache.insert_collection_key("c", key(1));
        assert!(cache.contains_collection("c"));
        assert_eq!(cache.collection_key("c"), Some(key(1)));

        // a second insert does not replace the resident key
        cache.insert_collection_key("c", key(2));
        assert_eq!(cache.collection_key("c"), Some(key(1)));

        cache.remove_collection("c");
        assert!(!cache.contains_collection("c"));
    }

    #[test]
    fn test_standalone_keys_are_disjoint_from_collections() {
        let mut cache = KeyCache::new();
        cache.insert_collection_key("name", key(1));
        assert!(!cache.contains_standalone("name"));
        cache.insert_standalone_key("name", key(2));
        assert_eq!(cache.collection_key("name"), Some(key(1)));
        assert_eq!(cache.standalone_key("name"), Some(key(2)));
    }

    #[tokio::test]
    async fn test_timer_aborted_on_eviction() {
        let mut cache = KeyCache::new();
        cache.insert_collection_key("c", key(1));
        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        cache.set_collection_timer("c", timer);
        assert!(cache.has_collection_timer("c"));
        cache.remove_collection("c");
        // entry drop aborts the timer; nothing to await on
        assert!(!cache.has_collection_timer("c"));
    }
}
