//! Two-Tier Chunk Cache
//!
//! Holds fixed-size slices of remote files so repeated reads avoid the network.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         TieredCache                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  VolatileStore (RAM)          │  PersistentStore (local disk)    │
//! │  ┌────────────────────────┐   │  ┌────────────────────────────┐  │
//! │  │ LRU by entry count     │   │  │ sha256 sharded files       │  │
//! │  │ shared Bytes handles   │◀──┼──│ + in-memory index          │  │
//! │  └────────────────────────┘   │  └────────────────────────────┘  │
//! │            ▲  promote on hit  │        ▲             │           │
//! │            │                  │  DiskWriter pool  Reclaimer      │
//! │         insert ───────────────┼────────┘     (high/low watermark)│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A chunk is visible in memory as soon as `insert` returns
//! - Disk writes are atomic: a crash leaves either the old state or the full
//!   new chunk, never a prefix
//! - Persistent tier faults lower the hit rate; they never fail a lookup

mod chunk;
mod disk;
mod manager;
mod memory;
mod metrics;
mod reclaim;
mod writer;

pub use chunk::{ChunkId, ChunkKey, KEY_LEN};
pub use disk::{DiskEntry, PersistentStore};
pub use manager::{CacheResult, CacheTier, TieredCache};
pub use memory::VolatileStore;
pub use metrics::{CacheMetrics, MetricsSnapshot, PrometheusExporter};
pub use reclaim::{DiskUsage, ReclaimConfig, ReclaimReport, ReclaimState, Reclaimer};
pub use writer::DiskWriter;

/// Chunk size used by the transport (128KB)
///
/// Informational only: the cache stores whatever length it is given.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;
