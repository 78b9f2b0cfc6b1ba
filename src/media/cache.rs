//! Byte-bounded LRU cache for plugin assets.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::CacheError;

struct Inner {
    entries: LruCache<String, Arc<[u8]>>,
    used: u64,
}

/// In-memory asset cache bounded by total size in bytes.
///
/// Inserting evicts least-recently-used entries until the new item fits;
/// an item larger than the whole capacity is rejected and leaves the cache
/// untouched.
pub struct AssetCache {
    inner: Mutex<Inner>,
    capacity: u64,
}

impl AssetCache {
    pub fn new(capacity: u64) -> Self {
        Self { inner: Mutex::new(Inner { entries: LruCache::unbounded(), used: 0 }), capacity }
    }

    /// Look up an asset, marking it most recently used.
    pub fn get(&self, id: &str) -> Option<Arc<[u8]>> {
        self.inner.lock().entries.get(id).cloned()
    }

    /// Whether `id` is cached, without touching recency.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains(id)
    }

    /// Insert or replace an asset; returns the ids evicted to make room.
    pub fn put(
        &self,
        id: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Result<Vec<String>, CacheError> {
        let id = id.into();
        let bytes = bytes.into();
        let size = bytes.len() as u64;

        if size > self.capacity {
            return Err(CacheError::AssetTooLarge { size, capacity: self.capacity });
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.pop(&id) {
            inner.used -= previous.len() as u64;
        }

        let mut evicted = Vec::new();
        while inner.used + size > self.capacity {
            let Some((old_id, old_bytes)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used -= old_bytes.len() as u64;
            evicted.push(old_id);
        }

        inner.used += size;
        inner.entries.put(id, bytes);
        Ok(evicted)
    }

    /// Drop an asset; returns whether it was cached.
    pub fn invalidate(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(id) {
            Some(bytes) => {
                inner.used -= bytes.len() as u64;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of cached assets.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache = AssetCache::new(100);
        assert!(cache.put("a", vec![1u8; 10]).unwrap().is_empty());

        assert_eq!(cache.get("a").as_deref(), Some(&[1u8; 10][..]));
        assert_eq!(cache.used_bytes(), 10);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = AssetCache::new(30);
        cache.put("a", vec![0u8; 10]).unwrap();
        cache.put("b", vec![0u8; 10]).unwrap();
        cache.put("c", vec![0u8; 10]).unwrap();

        // Touch "a" so "b" becomes the oldest.
        cache.get("a");

        let evicted = cache.put("d", vec![0u8; 15]).unwrap();
        assert_eq!(evicted, vec!["b".to_string(), "c".to_string()]);
        assert!(cache.contains("a"));
        assert!(cache.contains("d"));
        assert!(cache.used_bytes() <= 30);
    }

    #[test]
    fn test_oversize_rejected_without_eviction() {
        let cache = AssetCache::new(20);
        cache.put("a", vec![0u8; 10]).unwrap();

        let err = cache.put("huge", vec![0u8; 21]).unwrap_err();
        assert!(matches!(err, CacheError::AssetTooLarge { size: 21, capacity: 20 }));
        assert!(cache.contains("a"));
        assert_eq!(cache.used_bytes(), 10);
    }

    #[test]
    fn test_replace_same_id() {
        let cache = AssetCache::new(20);
        cache.put("a", vec![0u8; 15]).unwrap();
        let evicted = cache.put("a", vec![1u8; 18]).unwrap();

        assert!(evicted.is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 18);
    }

    #[test]
    fn test_invalidate() {
        let cache = AssetCache::new(20);
        cache.put("a", vec![0u8; 5]).unwrap();

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.used_bytes(), 0);
        assert!(cache.is_empty());
    }
}
