//! Unified Cache: a single process-wide bounded LRU
//! arbitrating memory across every index by byte cost, not item count.
//!
//! Grounded on `papaya::HashMap` concurrent-map usage in
//! `vector_core::hnsw` for lock-free-read concurrent access; the LRU
//! ordering itself is a small doubly-linked intrusive list guarded by a
//! `std::sync::Mutex`, since `papaya` has no ordering primitive and
//! eviction is allowed to race with reads — there's no happens-before
//! relationship promised between a write and a concurrent cache read.

use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, Mutex};

/// Tag distinguishing what kind of thing is cached, used only for
/// statistics/observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Vector,
    Bitmap,
    MetadataChunk,
    GraphNode,
    TreeObject,
    Blob,
}

#[derive(Clone)]
pub struct CachedItem {
    pub bytes: Arc<Vec<u8>>,
    pub kind: ItemKind,
}

struct Entry {
    item: CachedItem,
    cost: usize,
    prev: Option<String>,
    next: Option<String>,
}

struct Lru {
    entries: StdHashMap<String, Entry>,
    head: Option<String>,
    tail: Option<String>,
    used_bytes: usize,
    capacity_bytes: usize,
}

impl Lru {
    fn touch(&mut self, key: &str) {
        if self.head.as_deref() == Some(key) {
            return;
        }
        self.unlink(key);
        self.push_front(key.to_string());
    }

    fn unlink(&mut self, key: &str) {
        let (prev, next) = match self.entries.get(key) {
            Some(e) => (e.prev.clone(), e.next.clone()),
            None => return,
        };
        match &prev {
            Some(p) => {
                if let Some(pe) = self.entries.get_mut(p) {
                    pe.next = next.clone();
                }
            }
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => {
                if let Some(ne) = self.entries.get_mut(n) {
                    ne.prev = prev.clone();
                }
            }
            None => self.tail = prev.clone(),
        }
    }

    fn push_front(&mut self, key: String) {
        let old_head = self.head.take();
        if let Some(ref oh) = old_head {
            if let Some(e) = self.entries.get_mut(oh) {
                e.prev = Some(key.clone());
            }
        }
        if let Some(e) = self.entries.get_mut(&key) {
            e.next = old_head.clone();
            e.prev = None;
        }
        self.head = Some(key.clone());
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn evict_one(&mut self) -> Option<usize> {
        let tail = self.tail.clone()?;
        self.unlink(&tail);
        let entry = self.entries.remove(&tail)?;
        self.used_bytes -= entry.cost;
        Some(entry.cost)
    }
}

/// The single bounded LRU shared by every index. A process normally
/// holds exactly one `UnifiedCache`; tests that need isolation create a
/// fresh one rather than reach for a hidden static.
pub struct UnifiedCache {
    lru: Mutex<Lru>,
}

impl UnifiedCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            lru: Mutex::new(Lru {
                entries: StdHashMap::new(),
                head: None,
                tail: None,
                used_bytes: 0,
                capacity_bytes,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedItem> {
        let mut lru = self.lru.lock().unwrap();
        let item = lru.entries.get(key).map(|e| e.item.clone());
        if item.is_some() {
            lru.touch(key);
        }
        item
    }

    /// Admits `item` if it fits; otherwise evicts LRU entries until it
    /// fits or the cache is exhausted. Returns `false` (admission
    /// rejected) only when `cost_bytes` exceeds total capacity — callers
    /// should treat that as `CapacityExceeded`.
    pub fn put(&self, key: impl Into<String>, item: CachedItem, cost_bytes: usize) -> bool {
        let key = key.into();
        let mut lru = self.lru.lock().unwrap();
        if cost_bytes > lru.capacity_bytes {
            return false;
        }
        if let Some(old) = lru.entries.remove(&key) {
            lru.unlink(&key);
            lru.used_bytes -= old.cost;
        }
        while lru.used_bytes + cost_bytes > lru.capacity_bytes {
            if lru.evict_one().is_none() {
                break;
            }
        }
        lru.entries.insert(
            key.clone(),
            Entry {
                item,
                cost: cost_bytes,
                prev: None,
                next: None,
            },
        );
        lru.used_bytes += cost_bytes;
        lru.push_front(key);
        true
    }

    pub fn invalidate(&self, key: &str) {
        let mut lru = self.lru.lock().unwrap();
        lru.unlink(key);
        if let Some(e) = lru.entries.remove(key) {
            lru.used_bytes -= e.cost;
        }
    }

    pub fn remaining_capacity(&self) -> usize {
        let lru = self.lru.lock().unwrap();
        lru.capacity_bytes.saturating_sub(lru.used_bytes)
    }

    pub fn capacity(&self) -> usize {
        self.lru.lock().unwrap().capacity_bytes
    }

    /// Fraction of capacity in use, used by indices to choose between
    /// preload and lazy-load strategies.
    pub fn pressure(&self) -> f64 {
        let lru = self.lru.lock().unwrap();
        if lru.capacity_bytes == 0 {
            return 1.0;
        }
        lru.used_bytes as f64 / lru.capacity_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(bytes: &[u8]) -> CachedItem {
        CachedItem {
            bytes: Arc::new(bytes.to_vec()),
            kind: ItemKind::Blob,
        }
    }

    #[test]
    fn admits_then_evicts_lru_when_over_capacity() {
        let cache = UnifiedCache::new(10);
        assert!(cache.put("a", item(b"1234"), 4));
        assert!(cache.put("b", item(b"1234"), 4));
        // touching "a" makes it MRU, so "b" should be evicted next.
        assert!(cache.get("a").is_some());
        assert!(cache.put("c", item(b"1234"), 4));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn rejects_item_larger_than_capacity() {
        let cache = UnifiedCache::new(10);
        assert!(!cache.put("huge", item(&[0u8; 20]), 20));
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = UnifiedCache::new(10);
        cache.put("a", item(b"1"), 1);
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn pressure_reflects_usage_fraction() {
        let cache = UnifiedCache::new(100);
        cache.put("a", item(&[0u8; 30]), 30);
        assert!((cache.pressure() - 0.3).abs() < 1e-9);
    }
}
