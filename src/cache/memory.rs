//! Volatile Store - RAM-based Hot Tier
//!
//! Fixed-capacity, recency-ordered cache of chunk buffers held only in memory.
//!
//! # Design
//!
//! - Capacity is an entry count, so worst-case memory is
//!   `capacity * chunk size`
//! - Strict LRU: every `get` hit moves the entry to the front
//! - Payloads are [`Bytes`]; a handle returned to a reader stays valid after
//!   the entry is evicted or replaced
//! - No durability: contents vanish with the process

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use super::chunk::ChunkId;
use crate::error::{Error, Result};

/// Volatile Store - RAM-based hot tier
#[derive(Debug)]
pub struct VolatileStore {
    /// LRU storage (a hit reorders, so reads need the lock exclusively)
    storage: Mutex<LruCache<ChunkId, Bytes>>,
    /// Total payload bytes currently held
    size_bytes: AtomicU64,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
}

impl VolatileStore {
    /// Create a store holding at most `capacity` chunks
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            Error::Config("memory capacity must be greater than 0".to_string())
        })?;

        Ok(Self {
            storage: Mutex::new(LruCache::new(capacity)),
            size_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Get a chunk, marking it most recently used
    pub fn get(&self, id: &ChunkId) -> Option<Bytes> {
        let data = self.storage.lock().get(id).cloned();

        match &data {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };

        data
    }

    /// Get a chunk without touching recency
    pub fn peek(&self, id: &ChunkId) -> Option<Bytes> {
        self.storage.lock().peek(id).cloned()
    }

    /// Check presence without touching recency
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.storage.lock().contains(id)
    }

    /// Insert or replace a chunk, evicting the least recently used one when full
    pub fn put(&self, id: ChunkId, data: Bytes) {
        let displaced = {
            let mut storage = self.storage.lock();
            self.push_locked(&mut storage, id.clone(), data)
        };
        self.note_displaced(displaced, &id);
    }

    /// Insert a chunk only if none is held for `id`
    ///
    /// Returns whichever bytes the store holds for `id` afterwards, so a
    /// newer value put by a concurrent writer is never replaced.
    pub fn put_if_absent(&self, id: ChunkId, data: Bytes) -> Bytes {
        let displaced = {
            let mut storage = self.storage.lock();
            if let Some(existing) = storage.get(&id) {
                return existing.clone();
            }
            self.push_locked(&mut storage, id.clone(), data.clone())
        };
        self.note_displaced(displaced, &id);
        data
    }

    /// `push` hands back either the replaced value for `id` or the LRU victim
    fn push_locked(
        &self,
        storage: &mut LruCache<ChunkId, Bytes>,
        id: ChunkId,
        data: Bytes,
    ) -> Option<(ChunkId, Bytes)> {
        let size = data.len() as u64;
        let displaced = storage.push(id, data);
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some((_, old_data)) = &displaced {
            self.size_bytes
                .fetch_sub(old_data.len() as u64, Ordering::Relaxed);
        }
        displaced
    }

    fn note_displaced(&self, displaced: Option<(ChunkId, Bytes)>, id: &ChunkId) {
        if let Some((old_id, _)) = displaced {
            if old_id != *id {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(evicted = %old_id, "volatile store: evicted LRU chunk");
            }
        }
    }

    /// Remove a chunk
    pub fn remove(&self, id: &ChunkId) -> Option<Bytes> {
        let mut storage = self.storage.lock();
        let removed = storage.pop(id);
        if let Some(data) = &removed {
            self.size_bytes
                .fetch_sub(data.len() as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Number of chunks held
    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }

    /// Maximum number of chunks
    pub fn capacity(&self) -> usize {
        self.storage.lock().cap().get()
    }

    /// Payload bytes currently held
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Drop every chunk
    pub fn clear(&self) {
        let mut storage = self.storage.lock();
        storage.clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn chunk(path: &str, index: u64) -> ChunkId {
        ChunkId::new(path, index)
    }

    fn data(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_matches!(VolatileStore::new(0), Err(Error::Config(_)));
    }

    #[test]
    fn test_put_get() {
        let store = VolatileStore::new(10).unwrap();
        let id = chunk("file", 0);

        store.put(id.clone(), Bytes::from_static(b"hello"));

        assert!(store.contains(&id));
        assert_eq!(store.get(&id).unwrap().as_ref(), b"hello");
        assert_eq!(store.len(), 1);
        assert_eq!(store.size_bytes(), 5);
        assert_eq!(store.hits(), 1);
    }

    #[test]
    fn test_miss_counted() {
        let store = VolatileStore::new(10).unwrap();
        assert!(store.get(&chunk("missing", 0)).is_none());
        assert_eq!(store.misses(), 1);
        assert_eq!(store.hit_ratio(), 0.0);
    }

    #[test]
    fn test_lru_eviction_exactly_one() {
        let store = VolatileStore::new(3).unwrap();
        for i in 0..3 {
            store.put(chunk("file", i), data(i as u8, 10));
        }

        // Touch chunk 0 so chunk 1 becomes least recently used
        store.get(&chunk("file", 0));

        store.put(chunk("file", 3), data(3, 10));

        assert_eq!(store.len(), 3);
        assert_eq!(store.evictions(), 1);
        assert!(store.contains(&chunk("file", 0)));
        assert!(!store.contains(&chunk("file", 1)));
        assert!(store.contains(&chunk("file", 2)));
        assert!(store.contains(&chunk("file", 3)));
        assert_eq!(store.size_bytes(), 30);
    }

    #[test]
    fn test_contains_and_peek_do_not_promote() {
        let store = VolatileStore::new(2).unwrap();
        store.put(chunk("f", 0), data(0, 1));
        store.put(chunk("f", 1), data(1, 1));

        assert!(store.contains(&chunk("f", 0)));
        assert!(store.peek(&chunk("f", 0)).is_some());

        store.put(chunk("f", 2), data(2, 1));

        assert!(!store.contains(&chunk("f", 0)));
        assert!(store.contains(&chunk("f", 1)));
    }

    #[test]
    fn test_replace_is_not_an_eviction() {
        let store = VolatileStore::new(2).unwrap();
        let id = chunk("f", 0);

        store.put(id.clone(), data(1, 100));
        store.put(id.clone(), data(2, 40));

        assert_eq!(store.len(), 1);
        assert_eq!(store.evictions(), 0);
        assert_eq!(store.size_bytes(), 40);
        assert_eq!(store.get(&id).unwrap()[0], 2);
    }

    #[test]
    fn test_put_if_absent_keeps_existing_value() {
        let store = VolatileStore::new(4).unwrap();
        let id = chunk("f", 0);

        store.put(id.clone(), data(1, 8));
        let kept = store.put_if_absent(id.clone(), data(0, 16));

        assert_eq!(kept[0], 1);
        assert_eq!(store.peek(&id).unwrap()[0], 1);
        assert_eq!(store.size_bytes(), 8);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_put_if_absent_inserts_and_evicts() {
        let store = VolatileStore::new(1).unwrap();
        store.put(chunk("f", 0), data(0, 4));

        let stored = store.put_if_absent(chunk("f", 1), data(1, 6));

        assert_eq!(stored[0], 1);
        assert!(!store.contains(&chunk("f", 0)));
        assert_eq!(store.evictions(), 1);
        assert_eq!(store.size_bytes(), 6);
    }

    #[test]
    fn test_handle_outlives_eviction() {
        let store = VolatileStore::new(1).unwrap();
        store.put(chunk("f", 0), data(7, 16));

        let handle = store.get(&chunk("f", 0)).unwrap();
        store.put(chunk("f", 1), data(8, 16));

        assert!(!store.contains(&chunk("f", 0)));
        assert_eq!(handle.len(), 16);
        assert!(handle.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_remove_and_clear() {
        let store = VolatileStore::new(4).unwrap();
        store.put(chunk("f", 0), data(0, 8));
        store.put(chunk("f", 1), data(1, 8));

        assert!(store.remove(&chunk("f", 0)).is_some());
        assert!(store.remove(&chunk("f", 0)).is_none());
        assert_eq!(store.size_bytes(), 8);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
        assert_eq!(store.capacity(), 4);
    }
}
