//! Cache Configuration
//!
//! Every budget and watermark is threaded into the components from a single
//! [`CacheConfig`] value at construction time. Nothing is read from
//! process-wide state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of chunks held in memory (~500MB at 128KB chunks)
pub const DEFAULT_MEMORY_CAPACITY: usize = 4000;

/// Default on-disk budget (10GB)
pub const DEFAULT_MAX_DISK_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Start reclaiming when the disk tier reaches this fraction of the budget
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.9;

/// Reclaim until the disk tier is at or below this fraction of the budget
pub const DEFAULT_LOW_WATERMARK: f64 = 0.7;

/// Default reclamation tick
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of background disk writer threads
pub const DEFAULT_WRITER_THREADS: usize = 4;

/// Default number of disk writes that may wait for a writer thread
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 256;

/// Chunk cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Root directory of the persistent tier
    pub cache_root: PathBuf,

    /// Maximum number of chunks held by the volatile tier
    pub memory_capacity: usize,

    /// Byte budget of the persistent tier
    pub max_disk_bytes: u64,

    /// Fraction of `max_disk_bytes` that triggers reclamation
    pub high_watermark: f64,

    /// Fraction of `max_disk_bytes` that reclamation evicts down to
    pub low_watermark: f64,

    /// Reclamation tick interval
    #[serde(with = "duration_str")]
    pub reclaim_interval: Duration,

    /// Background disk writer threads
    pub writer_threads: usize,

    /// Pending disk writes beyond which new writes are dropped
    pub write_queue_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            max_disk_bytes: DEFAULT_MAX_DISK_BYTES,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            writer_threads: DEFAULT_WRITER_THREADS,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

impl CacheConfig {
    /// Create a configuration rooted at `cache_root` with default budgets
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Default::default()
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
        Self::from_yaml_str(&raw)
    }

    /// Reject configurations under which no correct cache state can exist
    pub fn validate(&self) -> Result<()> {
        if self.memory_capacity == 0 {
            return Err(Error::Config(
                "memoryCapacity must be greater than 0".to_string(),
            ));
        }
        if self.max_disk_bytes == 0 {
            return Err(Error::Config(
                "maxDiskBytes must be greater than 0".to_string(),
            ));
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
        if self.reclaim_interval.is_zero() {
            return Err(Error::Config(
                "reclaimInterval must be greater than 0".to_string(),
            ));
        }
        if self.writer_threads == 0 {
            return Err(Error::Config(
                "writerThreads must be greater than 0".to_string(),
            ));
        }
        if self.write_queue_depth == 0 {
            return Err(Error::Config(
                "writeQueueDepth must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Size that triggers reclamation
    pub fn high_watermark_bytes(&self) -> u64 {
        (self.max_disk_bytes as f64 * self.high_watermark).round() as u64
    }

    /// Size reclamation evicts down to
    pub fn low_watermark_bytes(&self) -> u64 {
        (self.max_disk_bytes as f64 * self.low_watermark).round() as u64
    }
}

/// Platform cache directory, falling back to the system temp dir
fn default_cache_root() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("chunkcache").join("chunks")
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like "30s", "5m", "1h" or "1h30m"
///
/// A trailing bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'd' | 'D' => 86400,
            'h' | 'H' => 3600,
            'm' | 'M' => 60,
            's' | 'S' => 1,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_secs = num
            .checked_mul(multiplier)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs
            .checked_add(num)
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    if total_secs == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Serde adapter storing durations as "<secs>s" strings
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
