//! TTL caches: directory listings keyed by `(mount, key, viewer scope)`,
//! plus a small generic TTL map the search layer reuses.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct TtlCache<K, V> {
    map: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.lock();
        match map.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.lock().insert(key, (Instant::now() + ttl, value));
    }

    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.lock().retain(|k, _| keep(k));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, (Instant, V)>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub mount_id: String,
    pub storage_key: String,
    pub viewer_scope: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Directory-listing cache. Values are the serialized listing payloads so
/// the cache stays agnostic of the service's response shape.
pub struct DirectoryCache {
    inner: TtlCache<ListingKey, serde_json::Value>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self {
            inner: TtlCache::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &ListingKey) -> Option<serde_json::Value> {
        let hit = self.inner.get(key);
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn put(&self, key: ListingKey, value: serde_json::Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.inner.put(key, value, ttl);
    }

    /// Invalidate everything a write at `storage_key` can have changed:
    /// listings of the key itself and its subtree, plus every ancestor
    /// listing that contains it.
    pub fn invalidate_write(&self, mount_id: &str, storage_key: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.inner.retain(|k| {
            if k.mount_id != mount_id {
                return true;
            }
            let below = portico_core::paths::key_within(&k.storage_key, storage_key);
            let ancestor = portico_core::paths::key_within(storage_key, &k.storage_key);
            !(below || ancestor)
        });
    }

    pub fn invalidate_mount(&self, mount_id: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.inner.retain(|k| k.mount_id != mount_id);
    }

    /// Admin-global or viewer-scoped flush.
    pub fn clear(&self, viewer_scope: Option<&str>) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        match viewer_scope {
            None => self.inner.clear(),
            Some(scope) => self.inner.retain(|k| k.viewer_scope != scope),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DirectoryCache, ListingKey};

    fn key(mount: &str, storage_key: &str) -> ListingKey {
        ListingKey {
            mount_id: mount.to_string(),
            storage_key: storage_key.to_string(),
            viewer_scope: "admin".to_string(),
        }
    }

    #[test]
    fn hit_then_expire() {
        let cache = DirectoryCache::new();
        cache.put(key("m", "a"), serde_json::json!(1), Duration::from_secs(60));
        assert!(cache.get(&key("m", "a")).is_some());

        cache.put(key("m", "b"), serde_json::json!(2), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&key("m", "b")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn write_invalidates_subtree_and_ancestors() {
        let cache = DirectoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.put(key("m", ""), serde_json::json!("root"), ttl);
        cache.put(key("m", "docs"), serde_json::json!("docs"), ttl);
        cache.put(key("m", "docs/sub"), serde_json::json!("sub"), ttl);
        cache.put(key("m", "other"), serde_json::json!("other"), ttl);
        cache.put(key("m2", "docs"), serde_json::json!("m2"), ttl);

        cache.invalidate_write("m", "docs/sub/file.txt");

        // Ancestors of the write and the subtree are gone.
        assert!(cache.get(&key("m", "")).is_none());
        assert!(cache.get(&key("m", "docs")).is_none());
        assert!(cache.get(&key("m", "docs/sub")).is_none());
        // Unrelated listing and other mounts survive.
        assert!(cache.get(&key("m", "other")).is_some());
        assert!(cache.get(&key("m2", "docs")).is_some());
    }

    #[test]
    fn scoped_clear_only_touches_one_viewer() {
        let cache = DirectoryCache::new();
        let ttl = Duration::from_secs(60);
        let mut admin_key = key("m", "a");
        admin_key.viewer_scope = "admin:1".to_string();
        let mut key_key = key("m", "a");
        key_key.viewer_scope = "key:2:/".to_string();
        cache.put(admin_key.clone(), serde_json::json!(1), ttl);
        cache.put(key_key.clone(), serde_json::json!(2), ttl);

        cache.clear(Some("key:2:/"));
        assert!(cache.get(&admin_key).is_some());
        assert!(cache.get(&key_key).is_none());
    }
}
