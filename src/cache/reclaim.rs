//! Reclamation Process - Disk Budget Enforcement
//!
//! Periodically measures the persistent tier and, once it exceeds the high
//! watermark, evicts least recently accessed chunks until it is at or below
//! the low watermark.
//!
//! # States
//!
//! ```text
//! Idle ──tick──▶ Measuring ──size > high──▶ Evicting
//!  ▲                 │                         │
//!  └────size <= high─┘◀────size <= low─────────┘
//! ```
//!
//! The gap between the watermarks means one cycle frees enough space to stay
//! quiet for a while instead of hovering at the trigger point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::disk::PersistentStore;
use super::metrics::CacheMetrics;
use crate::config::{self, CacheConfig};
use crate::error::{Error, Result};

/// Reclamation configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimConfig {
    /// Byte budget of the persistent tier
    pub max_bytes: u64,
    /// Fraction of `max_bytes` that starts eviction
    pub high_watermark: f64,
    /// Fraction of `max_bytes` eviction stops at
    pub low_watermark: f64,
    /// Time between cycles
    pub interval: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            max_bytes: config::DEFAULT_MAX_DISK_BYTES,
            high_watermark: config::DEFAULT_HIGH_WATERMARK,
            low_watermark: config::DEFAULT_LOW_WATERMARK,
            interval: config::DEFAULT_RECLAIM_INTERVAL,
        }
    }
}

impl From<&CacheConfig> for ReclaimConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_bytes: config.max_disk_bytes,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            interval: config.reclaim_interval,
        }
    }
}

impl ReclaimConfig {
    fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::Config("max_bytes must be greater than 0".to_string()));
        }
        if !(self.low_watermark > 0.0
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= 1.0)
        {
            return Err(Error::Config(format!(
                "watermarks must satisfy 0 < low < high <= 1 (low={}, high={})",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.interval.is_zero() {
            return Err(Error::Config("interval must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Size above which a cycle evicts
    pub fn high_watermark_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.high_watermark).round() as u64
    }

    /// Size a triggered cycle evicts down to
    pub fn low_watermark_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.low_watermark).round() as u64
    }
}

/// Reclaimer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReclaimState {
    /// Waiting for the next tick
    Idle,
    /// Computing the persistent tier size
    Measuring,
    /// Deleting cold entries
    Evicting,
}

/// Outcome of one cycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimReport {
    /// Whether the cycle entered Evicting
    pub triggered: bool,
    pub entries_evicted: u64,
    pub bytes_freed: u64,
    /// Persistent tier size when the cycle ended
    pub bytes_remaining: u64,
    /// Deletes that failed and were skipped
    pub failures: u64,
    pub finished_at: DateTime<Utc>,
}

/// Current persistent tier usage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub current_bytes: u64,
    pub max_bytes: u64,
    pub entry_count: usize,
    pub usage_percent: u32,
}

/// Background reclamation process for a [`PersistentStore`]
pub struct Reclaimer {
    store: Arc<PersistentStore>,
    config: ReclaimConfig,
    state: Mutex<ReclaimState>,
    /// Serializes cycles so two callers never evict the same range twice
    cycle: Mutex<()>,
    last_report: Mutex<Option<ReclaimReport>>,
    metrics: Option<Arc<CacheMetrics>>,
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("last_report", &self.last_report)
            .finish_non_exhaustive()
    }
}

impl Reclaimer {
    /// Create a reclaimer for `store`
    pub fn new(store: Arc<PersistentStore>, config: ReclaimConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            state: Mutex::new(ReclaimState::Idle),
            cycle: Mutex::new(()),
            last_report: Mutex::new(None),
            metrics: None,
        })
    }

    /// Report cycle outcomes into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current state
    pub fn state(&self) -> ReclaimState {
        *self.state.lock()
    }

    pub fn config(&self) -> &ReclaimConfig {
        &self.config
    }

    /// Report from the most recent cycle
    pub fn last_report(&self) -> Option<ReclaimReport> {
        self.last_report.lock().clone()
    }

    fn set_state(&self, state: ReclaimState) {
        *self.state.lock() = state;
    }

    /// Run one Measuring (and, if over the high watermark, Evicting) pass
    pub fn run_cycle(&self) -> ReclaimReport {
        let _cycle = self.cycle.lock();

        self.set_state(ReclaimState::Measuring);
        let current = self.store.total_size();
        let threshold = self.config.high_watermark_bytes();

        let report = if current > threshold {
            info!(
                current_bytes = current,
                max_bytes = self.config.max_bytes,
                usage_percent = usage_percent(current, self.config.max_bytes),
                "Starting reclamation"
            );
            self.evict_to_low_watermark()
        } else {
            debug!(
                current_bytes = current,
                threshold_bytes = threshold,
                "Reclamation check: below high watermark"
            );
            ReclaimReport {
                triggered: false,
                entries_evicted: 0,
                bytes_freed: 0,
                bytes_remaining: current,
                failures: 0,
                finished_at: Utc::now(),
            }
        };

        self.finish(report)
    }

    /// Evict to the low watermark regardless of the high watermark
    pub fn force_cycle(&self) -> ReclaimReport {
        let _cycle = self.cycle.lock();

        self.set_state(ReclaimState::Measuring);
        info!(current_bytes = self.store.total_size(), "Forced reclamation");
        let report = self.evict_to_low_watermark();

        self.finish(report)
    }

    fn finish(&self, report: ReclaimReport) -> ReclaimReport {
        self.set_state(ReclaimState::Idle);
        if let Some(metrics) = &self.metrics {
            metrics.record_reclaim(report.entries_evicted, report.bytes_freed);
        }
        *self.last_report.lock() = Some(report.clone());
        report
    }

    fn evict_to_low_watermark(&self) -> ReclaimReport {
        self.set_state(ReclaimState::Evicting);

        let target = self.config.low_watermark_bytes();
        let mut remaining = self.store.total_size();
        let mut entries_evicted = 0u64;
        let mut bytes_freed = 0u64;
        let mut failures = 0u64;

        for (key, entry) in self.store.entries_by_access_time() {
            if remaining <= target {
                break;
            }

            match self.store.remove_if_unchanged(&key, entry.access_seq) {
                Ok(Some(size)) => {
                    entries_evicted += 1;
                    bytes_freed += size;
                    remaining = remaining.saturating_sub(size);
                }
                Ok(None) => {
                    trace!(chunk = %key, "chunk touched since snapshot, sparing");
                }
                Err(e) => {
                    // The index record is already gone; only the file lingers
                    failures += 1;
                    remaining = remaining.saturating_sub(entry.size);
                    warn!(chunk = %key, error = %e, "Failed to evict chunk");
                }
            }
        }

        let bytes_remaining = self.store.total_size();
        info!(
            entries_evicted,
            bytes_freed,
            bytes_remaining,
            failures,
            "Reclamation complete"
        );

        ReclaimReport {
            triggered: true,
            entries_evicted,
            bytes_freed,
            bytes_remaining,
            failures,
            finished_at: Utc::now(),
        }
    }

    /// Current usage of the persistent tier
    pub fn usage(&self) -> DiskUsage {
        let current_bytes = self.store.total_size();
        DiskUsage {
            current_bytes,
            max_bytes: self.config.max_bytes,
            entry_count: self.store.len(),
            usage_percent: usage_percent(current_bytes, self.config.max_bytes),
        }
    }

    /// Run cycles on a fixed interval until `shutdown` is cancelled
    ///
    /// The first cycle runs immediately so a store left over budget by a
    /// previous process is trimmed at startup. Cycles run on the blocking
    /// pool since they delete files.
    #[instrument(skip_all, name = "reclaimer")]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            max_bytes = self.config.max_bytes,
            high_watermark = self.config.high_watermark,
            low_watermark = self.config.low_watermark,
            "Starting reclaimer"
        );

        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reclaimer shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let this = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || this.run_cycle()).await {
                        error!("Reclamation cycle aborted: {}", e);
                    }
                }
            }
        }
    }
}

fn usage_percent(current: u64, max: u64) -> u32 {
    if max == 0 {
        0
    } else {
        (current as u128 * 100 / max as u128) as u32
    }
}

// =============================================================================
// Tests
// =============================================================================
