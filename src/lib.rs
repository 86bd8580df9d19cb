//! chunkcache - Tiered Chunk Cache for a Network Filesystem
//!
//! Caches the chunks a peer-to-peer filesystem fetches from remote hosts, in
//! memory and on local disk, so repeated reads are served locally.
//!
//! # Architecture
//!
//! ```text
//! filesystem bridge ──get──▶ TieredCache ──miss──▶ network fetch
//!         ▲                    │      ▲                  │
//!         └────── bytes ───────┘      └────── insert ────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Chunk identity, both tiers, detached writes and reclamation
//! - [`config`] - Budgets, watermarks and intervals
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{ChunkId, MetricsSnapshot, Reclaimer, TieredCache};
pub use config::CacheConfig;
pub use error::{Error, Result};
