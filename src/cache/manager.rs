//! Tiered Cache - Memory over Disk
//!
//! The single entry point the filesystem bridge uses for chunk data.
//!
//! # Design
//!
//! - `get` checks memory, then disk; a disk hit is copied into memory so the
//!   next lookup for it never touches the filesystem
//! - `insert` updates memory before returning and hands the disk write to a
//!   background pool; the caller never waits for durability
//! - A persistent tier failure is logged and treated as a miss or a skipped
//!   write. Only misconfiguration is fatal, and only at construction.
//!
//! Lookups that reach the disk tier do blocking file I/O on the calling
//! thread; async callers should use `spawn_blocking`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::chunk::ChunkId;
use super::disk::PersistentStore;
use super::memory::VolatileStore;
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::reclaim::{ReclaimConfig, Reclaimer};
use super::writer::DiskWriter;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Tier that served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Volatile store (RAM)
    Memory,
    /// Persistent store (local disk)
    Disk,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Disk => write!(f, "disk"),
        }
    }
}

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheResult {
    /// Chunk bytes
    pub data: Bytes,
    /// Which tier the chunk was found in
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

/// Two-tier chunk cache
pub struct TieredCache {
    memory: VolatileStore,
    /// Absent when the cache root could not be opened
    persistent: Option<Arc<PersistentStore>>,
    /// Absent when memory-only, or when the writer pool failed to start
    writer: Option<DiskWriter>,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl TieredCache {
    /// Build both tiers from `config`
    ///
    /// Fails only on an invalid configuration. An unusable cache root
    /// degrades to a memory-only cache.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let memory = VolatileStore::new(config.memory_capacity)?;
        let metrics = Arc::new(CacheMetrics::new());

        let persistent = match PersistentStore::open(&config.cache_root) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(
                    root = %config.cache_root.display(),
                    error = %e,
                    "Persistent tier unavailable, running memory-only"
                );
                None
            }
        };

        let writer = match &persistent {
            Some(store) => match DiskWriter::new(
                store.clone(),
                config.writer_threads,
                config.write_queue_depth,
                metrics.clone(),
            ) {
                Ok(writer) => Some(writer),
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Disk writer pool failed to start, inserts stay in memory");
                    None
                }
            },
            None => None,
        };

        info!(
            memory_capacity = config.memory_capacity,
            max_disk_bytes = config.max_disk_bytes,
            persistent = persistent.is_some(),
            "Tiered cache opened"
        );

        Ok(Self {
            memory,
            persistent,
            writer,
            config,
            metrics,
        })
    }

    /// Cache with no persistent tier
    pub fn memory_only(capacity: usize) -> Result<Self> {
        let config = CacheConfig {
            memory_capacity: capacity,
            ..Default::default()
        };
        config.validate()?;

        Ok(Self {
            memory: VolatileStore::new(capacity)?,
            persistent: None,
            writer: None,
            config,
            metrics: Arc::new(CacheMetrics::new()),
        })
    }

    /// Look up a chunk
    pub fn get(&self, id: &ChunkId) -> Option<Bytes> {
        self.get_with_tier(id).map(|r| r.data)
    }

    /// Look up a chunk, reporting which tier served it
    pub fn get_with_tier(&self, id: &ChunkId) -> Option<CacheResult> {
        let start = Instant::now();

        if let Some(data) = self.memory.get(id) {
            self.metrics.record_memory_hit();
            trace!(chunk = %id, "memory hit");
            return Some(CacheResult {
                data,
                tier: CacheTier::Memory,
                latency: start.elapsed(),
            });
        }

        let Some(store) = &self.persistent else {
            self.metrics.record_miss();
            return None;
        };

        match store.read(id) {
            Ok(Some(data)) => {
                self.metrics.record_disk_hit(start.elapsed());
                let data = self.promote(id, data);
                Some(CacheResult {
                    data,
                    tier: CacheTier::Disk,
                    latency: start.elapsed(),
                })
            }
            Ok(None) => {
                self.metrics.record_miss();
                trace!(chunk = %id, "miss");
                None
            }
            Err(e) => {
                if matches!(e, Error::IndexDivergence { .. }) {
                    self.metrics.record_divergence();
                }
                self.metrics.record_miss();
                warn!(chunk = %id, error = %e, "disk read failed, treating as miss");
                None
            }
        }
    }

    /// Copy bytes read from disk into memory
    ///
    /// An `insert` that completed while the disk read was in flight holds
    /// newer bytes; those win and are returned instead.
    fn promote(&self, id: &ChunkId, from_disk: Bytes) -> Bytes {
        let data = self.memory.put_if_absent(id.clone(), from_disk);
        self.metrics.record_promotion();
        debug!(chunk = %id, bytes = data.len(), "disk hit, promoted to memory");
        data
    }

    /// Store a chunk fetched from the network
    ///
    /// Visible to `get` as soon as this returns. The disk write completes
    /// later, or not at all if the writer queue is full or the write fails.
    pub fn insert(&self, id: ChunkId, data: Bytes) {
        self.memory.put(id.clone(), data.clone());

        if let Some(writer) = &self.writer {
            writer.submit(id, data);
        }
    }

    /// Check either tier without reading or promoting
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.memory.contains(id)
            || self
                .persistent
                .as_ref()
                .is_some_and(|store| store.contains(id))
    }

    /// Drop a chunk from both tiers
    ///
    /// A disk write still queued for the chunk may land afterwards; call
    /// [`flush`](Self::flush) first when that matters.
    pub fn invalidate(&self, id: &ChunkId) {
        self.memory.remove(id);

        if let Some(store) = &self.persistent {
            if let Err(e) = store.remove(id) {
                warn!(chunk = %id, error = %e, "failed to remove chunk from disk");
            }
        }
    }

    /// Drop every chunk held in memory
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Block until queued disk writes have finished
    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    /// Build a reclaimer for the persistent tier, sharing this cache's metrics
    pub fn reclaimer(&self) -> Option<Result<Reclaimer>> {
        let store = self.persistent.clone()?;
        Some(
            Reclaimer::new(store, ReclaimConfig::from(&self.config))
                .map(|r| r.with_metrics(self.metrics.clone())),
        )
    }

    pub fn memory(&self) -> &VolatileStore {
        &self.memory
    }

    pub fn persistent(&self) -> Option<&Arc<PersistentStore>> {
        self.persistent.as_ref()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot of counters and current tier occupancy
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .update_memory_stats(self.memory.len() as u64, self.memory.size_bytes());
        if let Some(store) = &self.persistent {
            self.metrics
                .update_disk_stats(store.len() as u64, store.total_size());
        }
        self.metrics.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
