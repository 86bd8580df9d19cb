//! Cache Metrics Collection
//!
//! Counters for every tier decision, exported as a serializable snapshot and
//! as Prometheus metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookups
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    divergences: AtomicU64,

    // Detached disk writes
    disk_writes_queued: AtomicU64,
    disk_writes_completed: AtomicU64,
    disk_writes_dropped: AtomicU64,
    disk_write_failures: AtomicU64,

    // Reclamation
    reclaim_cycles: AtomicU64,
    reclaimed_entries: AtomicU64,
    reclaimed_bytes: AtomicU64,

    // Tier occupancy, refreshed on snapshot
    memory_entries: AtomicU64,
    memory_bytes: AtomicU64,
    disk_entries: AtomicU64,
    disk_bytes: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    disk_read_latency_us: AtomicU64,
    disk_write_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self, latency: Duration) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&self.disk_read_latency_us, latency);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_divergence(&self) {
        self.divergences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_queued(&self) {
        self.disk_writes_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_dropped(&self) {
        self.disk_writes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_completed(&self, latency: Duration) {
        self.disk_writes_completed.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&self.disk_write_latency_us, latency);
    }

    pub fn record_write_failure(&self) {
        self.disk_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one reclamation cycle and what it evicted
    pub fn record_reclaim(&self, entries: u64, bytes: u64) {
        self.reclaim_cycles.fetch_add(1, Ordering::Relaxed);
        self.reclaimed_entries.fetch_add(entries, Ordering::Relaxed);
        self.reclaimed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_memory_stats(&self, entries: u64, bytes: u64) {
        self.memory_entries.store(entries, Ordering::Relaxed);
        self.memory_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn update_disk_stats(&self, entries: u64, bytes: u64) {
        self.disk_entries.store(entries, Ordering::Relaxed);
        self.disk_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn disk_read_latency(&self) -> Duration {
        Duration::from_micros(self.disk_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn disk_write_latency(&self) -> Duration {
        Duration::from_micros(self.disk_write_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of lookups served by either tier
    pub fn hit_ratio(&self) -> f64 {
        hit_ratio(self.memory_hits() + self.disk_hits(), self.misses())
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits(),
            disk_hits: self.disk_hits(),
            misses: self.misses(),
            promotions: self.promotions.load(Ordering::Relaxed),
            divergences: self.divergences.load(Ordering::Relaxed),

            disk_writes_queued: self.disk_writes_queued.load(Ordering::Relaxed),
            disk_writes_completed: self.disk_writes_completed.load(Ordering::Relaxed),
            disk_writes_dropped: self.disk_writes_dropped.load(Ordering::Relaxed),
            disk_write_failures: self.disk_write_failures.load(Ordering::Relaxed),

            reclaim_cycles: self.reclaim_cycles.load(Ordering::Relaxed),
            reclaimed_entries: self.reclaimed_entries.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),

            memory_entries: self.memory_entries.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            disk_entries: self.disk_entries.load(Ordering::Relaxed),
            disk_bytes: self.disk_bytes.load(Ordering::Relaxed),

            disk_read_latency_us: self.disk_read_latency_us.load(Ordering::Relaxed),
            disk_write_latency_us: self.disk_write_latency_us.load(Ordering::Relaxed),
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    // Lookups
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub divergences: u64,

    // Detached writes
    pub disk_writes_queued: u64,
    pub disk_writes_completed: u64,
    pub disk_writes_dropped: u64,
    pub disk_write_failures: u64,

    // Reclamation
    pub reclaim_cycles: u64,
    pub reclaimed_entries: u64,
    pub reclaimed_bytes: u64,

    // Occupancy
    pub memory_entries: u64,
    pub memory_bytes: u64,
    pub disk_entries: u64,
    pub disk_bytes: u64,

    // Latency
    pub disk_read_latency_us: u64,
    pub disk_write_latency_us: u64,
}

impl MetricsSnapshot {
    /// Fraction of lookups served by either tier
    pub fn hit_ratio(&self) -> f64 {
        hit_ratio(self.memory_hits + self.disk_hits, self.misses)
    }
}

// =============================================================================
// Prometheus Export
// =============================================================================

/// Prometheus view of [`MetricsSnapshot`]
///
/// Counters are advanced to the snapshot value on each [`observe`](Self::observe),
/// gauges are overwritten.
pub struct PrometheusExporter {
    counters: Vec<(IntCounter, fn(&MetricsSnapshot) -> u64)>,
    gauges: Vec<(IntGauge, fn(&MetricsSnapshot) -> u64)>,
    /// Serializes read-then-advance of the counters
    observe_lock: Mutex<()>,
}

impl PrometheusExporter {
    /// Create the metric families and register them with `registry`
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let counter_defs: [(&str, &str, fn(&MetricsSnapshot) -> u64); 12] = [
            ("memory_hits_total", "Lookups served from memory", |s| s.memory_hits),
            ("disk_hits_total", "Lookups served from disk", |s| s.disk_hits),
            ("misses_total", "Lookups served by neither tier", |s| s.misses),
            ("promotions_total", "Disk hits copied into memory", |s| s.promotions),
            (
                "divergences_total",
                "Indexed chunks whose file was unreadable",
                |s| s.divergences,
            ),
            (
                "disk_writes_queued_total",
                "Disk writes accepted by the writer pool",
                |s| s.disk_writes_queued,
            ),
            (
                "disk_writes_completed_total",
                "Disk writes made durable",
                |s| s.disk_writes_completed,
            ),
            (
                "disk_writes_dropped_total",
                "Disk writes skipped because the queue was full",
                |s| s.disk_writes_dropped,
            ),
            ("disk_write_failures_total", "Disk writes that failed", |s| s.disk_write_failures),
            ("reclaim_cycles_total", "Reclamation cycles run", |s| s.reclaim_cycles),
            ("reclaimed_entries_total", "Chunks evicted from disk", |s| s.reclaimed_entries),
            ("reclaimed_bytes_total", "Bytes evicted from disk", |s| s.reclaimed_bytes),
        ];
        let gauge_defs: [(&str, &str, fn(&MetricsSnapshot) -> u64); 6] = [
            ("memory_entries", "Chunks held in memory", |s| s.memory_entries),
            ("memory_bytes", "Bytes held in memory", |s| s.memory_bytes),
            ("disk_entries", "Chunks held on disk", |s| s.disk_entries),
            ("disk_bytes", "Bytes held on disk", |s| s.disk_bytes),
            (
                "disk_read_latency_us",
                "Smoothed disk read latency",
                |s| s.disk_read_latency_us,
            ),
            (
                "disk_write_latency_us",
                "Smoothed disk write latency",
                |s| s.disk_write_latency_us,
            ),
        ];

        let mut counters = Vec::with_capacity(counter_defs.len());
        for (name, help, field) in counter_defs {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace("chunkcache"))?;
            registry.register(Box::new(counter.clone()))?;
            counters.push((counter, field));
        }

        let mut gauges = Vec::with_capacity(gauge_defs.len());
        for (name, help, field) in gauge_defs {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace("chunkcache"))?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.push((gauge, field));
        }

        Ok(Self {
            counters,
            gauges,
            observe_lock: Mutex::new(()),
        })
    }

    /// Bring every exported metric up to date with `snapshot`
    pub fn observe(&self, snapshot: &MetricsSnapshot) {
        let _guard = self.observe_lock.lock();
        for (counter, field) in &self.counters {
            let value = field(snapshot);
            let current = counter.get();
            if value > current {
                counter.inc_by(value - current);
            }
        }
        for (gauge, field) in &self.gauges {
            gauge.set(field(snapshot) as i64);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.memory_hits(), 0);
        assert_eq!(metrics.disk_hits(), 0);
        assert_eq!(metrics.hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_memory_hit();
        metrics.record_disk_hit(Duration::from_micros(50));
        metrics.record_miss();

        assert_eq!(metrics.memory_hits(), 1);
        assert_eq!(metrics.disk_hits(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_write_completed(Duration::from_micros(100));
        assert_eq!(metrics.disk_write_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_write_completed(Duration::from_micros(200));
        let latency = metrics.disk_write_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();

        metrics.record_memory_hit();
        metrics.record_promotion();
        metrics.record_write_queued();
        metrics.record_write_dropped();
        metrics.record_reclaim(3, 300);
        metrics.update_memory_stats(10, 1024);
        metrics.update_disk_stats(5, 4096);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_hits, 1);
        assert_eq!(snapshot.promotions, 1);
        assert_eq!(snapshot.disk_writes_queued, 1);
        assert_eq!(snapshot.disk_writes_dropped, 1);
        assert_eq!(snapshot.reclaim_cycles, 1);
        assert_eq!(snapshot.reclaimed_entries, 3);
        assert_eq!(snapshot.reclaimed_bytes, 300);
        assert_eq!(snapshot.memory_entries, 10);
        assert_eq!(snapshot.disk_bytes, 4096);
        assert_eq!(snapshot.hit_ratio(), 1.0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = MetricsSnapshot {
            disk_hits: 7,
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["diskHits"], 7);
    }

    #[test]
    fn test_prometheus_export() {
        let registry = Registry::new();
        let exporter = PrometheusExporter::register(&registry).unwrap();

        let metrics = CacheMetrics::new();
        metrics.record_memory_hit();
        metrics.record_memory_hit();
        metrics.update_disk_stats(2, 256);
        exporter.observe(&metrics.snapshot());

        metrics.record_memory_hit();
        exporter.observe(&metrics.snapshot());

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("chunkcache_memory_hits_total 3"));
        assert!(text.contains("chunkcache_disk_bytes 256"));
        assert!(text.contains("chunkcache_disk_entries 2"));
    }

    #[test]
    fn test_concurrent_observe_does_not_overshoot() {
        let registry = Registry::new();
        let exporter = PrometheusExporter::register(&registry).unwrap();

        let metrics = CacheMetrics::new();
        for _ in 0..1000 {
            metrics.record_memory_hit();
        }
        let snapshot = metrics.snapshot();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        exporter.observe(&snapshot);
                    }
                });
            }
        });

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("chunkcache_memory_hits_total 1000\n"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PrometheusExporter::register(&registry).unwrap();
        assert!(PrometheusExporter::register(&registry).is_err());
    }
}
