//! Resource cache
//!
//! Maps a resource index to the shared block that was published for it.
//! The first insert for an index wins; a later insert for the same index is
//! dropped and the published block returned instead. The in-flight set lets
//! the manager run at most one storage read per index at a time.

use crate::block::ResourceBlock;
use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// One published resource
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub type_id: u32,
    pub block: Arc<ResourceBlock>,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups that found a published resource
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Resources currently published
    pub entries: usize,
    /// Loads currently running
    pub in_flight: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: RwLock<HashMap<u32, CacheEntry, RandomState>>,
    in_flight: Mutex<HashSet<u32, RandomState>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourceCache {
    pub fn new() -> Self {
        ResourceCache::default()
    }

    pub fn get(&self, index: u32) -> Option<Arc<ResourceBlock>> {
        self.get_entry(index).map(|entry| entry.block)
    }

    /// Published entry with the type it was loaded as
    pub fn get_entry(&self, index: u32) -> Option<CacheEntry> {
        let found = self.entries.read().get(&index).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Type of the published entry, without touching the hit counters
    pub fn type_of(&self, index: u32) -> Option<u32> {
        self.entries.read().get(&index).map(|entry| entry.type_id)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.read().contains_key(&index)
    }

    /// Publish `block` unless `index` already has a block; returns the published one
    pub fn insert(&self, index: u32, type_id: u32, block: Arc<ResourceBlock>) -> Arc<ResourceBlock> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&index) {
            if existing.block != block {
                warn!(
                    "Resource {} was loaded twice with different contents, keeping the first",
                    index
                );
            }
            return existing.block.clone();
        }
        entries.insert(
            index,
            CacheEntry {
                type_id,
                block: block.clone(),
            },
        );
        block
    }

    pub fn remove(&self, index: u32) -> Option<CacheEntry> {
        self.entries.write().remove(&index)
    }

    /// True if any entry still holds `block`
    pub fn publishes(&self, block: &Arc<ResourceBlock>) -> bool {
        self.entries
            .read()
            .values()
            .any(|entry| Arc::ptr_eq(&entry.block, block))
    }

    /// Copy of every published entry
    pub fn snapshot(&self) -> Vec<(u32, CacheEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(index, entry)| (*index, entry.clone()))
            .collect()
    }

    /// Empty the cache, returning what was published
    pub fn drain(&self) -> Vec<(u32, CacheEntry)> {
        self.entries.write().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Claim the right to load `index`; `None` while another load runs
    pub fn begin_load(&self, index: u32) -> Option<LoadGuard<'_>> {
        if self.in_flight.lock().insert(index) {
            Some(LoadGuard { cache: self, index })
        } else {
            None
        }
    }

    pub fn is_loading(&self, index: u32) -> bool {
        self.in_flight.lock().contains(&index)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            in_flight: self.in_flight.lock().len(),
        }
    }
}

/// Marks an index as loading until dropped
#[derive(Debug)]
pub struct LoadGuard<'a> {
    cache: &'a ResourceCache,
    index: u32,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.cache.in_flight.lock().remove(&self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::AddressWidth;

    fn block(data: &[u8]) -> Arc<ResourceBlock> {
        Arc::new(ResourceBlock::from_vec(data.to_vec(), AddressWidth::host()))
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = ResourceCache::new();
        let first = cache.insert(1, 7, block(b"one"));
        let second = cache.insert(1, 7, block(b"two"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.get(1).unwrap().data(), b"one");
        assert_eq!(cache.len(), 1);

        cache.insert(1, 9, block(b"three"));
        assert_eq!(cache.type_of(1), Some(7));
        assert_eq!(cache.get_entry(1).unwrap().type_id, 7);
    }

    #[test]
    fn test_hit_rate_calculation() {
        let cache = ResourceCache::new();
        cache.insert(1, 7, block(b"x"));
        cache.get(1);
        cache.get(1);
        cache.get(2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 66.66).abs() < 0.1);
    }

    #[test]
    fn test_load_guard() {
        let cache = ResourceCache::new();
        let guard = cache.begin_load(3).unwrap();
        assert!(cache.begin_load(3).is_none());
        assert!(cache.is_loading(3));
        drop(guard);
        assert!(!cache.is_loading(3));
        assert!(cache.begin_load(3).is_some());
    }

    #[test]
    fn test_snapshot_and_drain() {
        let cache = ResourceCache::new();
        cache.insert(1, 7, block(b"a"));
        cache.insert(2, 8, block(b"b"));
        cache.insert(3, 7, block(b"c"));

        let mut snapshot = cache.snapshot();
        snapshot.sort_by_key(|(index, _)| *index);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[1].1.type_id, 8);

        assert_eq!(cache.remove(2).unwrap().block.data(), b"b");
        assert!(!cache.contains(2));
        assert_eq!(cache.drain().len(), 2);
        assert!(cache.is_empty());
    }
}
