//! Bounded LRU cache for full-text query results.
//!
//! [`LruCache`] is a slab of nodes threaded on a doubly-linked recency list
//! plus a key → slot map, giving O(1) `get`/`put` and cheap eviction from the
//! cold end. [`QueryCache`] wraps it behind a single mutex and applies the
//! batch eviction policy: once the cache grows past capacity it is cut back
//! to half capacity in one go.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::models::StoredChunk;

struct Node<V> {
    key: String,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Access-ordered map. `head` is the most recently used entry.
pub struct LruCache<V> {
    map: HashMap<String, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V> Default for LruCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> LruCache<V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|n| &n.value)
    }

    /// Insert or replace `key` as the most recently used entry.
    pub fn put(&mut self, key: String, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = self.slots[idx].as_mut() {
                node.value = value;
            }
            self.detach(idx);
            self.push_front(idx);
            return;
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    /// Evict least recently used entries until at most `target` remain.
    /// Returns the evicted keys, coldest first.
    pub fn evict_to(&mut self, target: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.map.len() > target {
            let Some(idx) = self.tail else { break };
            self.detach(idx);
            if let Some(node) = self.slots[idx].take() {
                self.map.remove(&node.key);
                evicted.push(node.key);
            }
            self.free.push(idx);
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.slots[idx].as_ref() else { break };
            keys.push(node.key.as_str());
            cursor = node.next;
        }
        keys
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.slots[p].as_mut() {
                    n.next = next;
                }
            }
            None => {
                if self.head == Some(idx) {
                    self.head = next;
                }
            }
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.slots[nx].as_mut() {
                    n.prev = prev;
                }
            }
            None => {
                if self.tail == Some(idx) {
                    self.tail = prev;
                }
            }
        }
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.slots[h].as_mut() {
                n.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

/// Hit/miss counters reported by `mem stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Thread-safe cache of full-text results keyed by the raw query string.
///
/// The result breadth is fixed by the first query: a later hit asking for a
/// larger `limit` gets the cached set truncated to its own limit, never a
/// re-query.
///
/// Every [`invalidate`](Self::invalidate) bumps a generation counter. A
/// search captures the generation before querying the store and hands it
/// back to [`put`](Self::put); results computed before an index write are
/// dropped instead of cached.
pub struct QueryCache {
    inner: Mutex<LruCache<Arc<Vec<StoredChunk>>>>,
    capacity: usize,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new()),
            capacity: capacity.max(2),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, query: &str, limit: usize) -> Option<Vec<StoredChunk>> {
        let mut cache = self.lock();
        match cache.get(query) {
            Some(results) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(results.iter().take(limit).cloned().collect())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cache `results` for `query` unless the index was written since
    /// `generation` was read. Returns whether the entry was stored.
    pub fn put(&self, query: &str, generation: u64, results: Vec<StoredChunk>) -> bool {
        let mut cache = self.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(query, "index changed during query, result not cached");
            return false;
        }
        cache.put(query.to_string(), Arc::new(results));
        if cache.len() > self.capacity {
            let evicted = cache.evict_to(self.capacity / 2);
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            tracing::debug!(evicted = evicted.len(), "query cache evicted cold entries");
        }
        true
    }

    /// Drop every cached result and start a new generation.
    pub fn invalidate(&self) {
        let mut cache = self.lock();
        cache.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<Arc<Vec<StoredChunk>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
