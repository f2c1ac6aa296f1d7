//! Configuration for the store, its containers and their buffers.
//!
//! Every settings struct has a `Default` derived from the detected
//! `TuningProfile` and a `from_env()` that applies `ROWSTORE_*` overrides.
//! Unparseable overrides are logged and ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::TuningProfile;

/// Default LRU tier capacity of the table cache.
pub const DEFAULT_LRU_CACHE_SIZE: usize = 32;

/// Default number of identifiers kept by the best-effort cache tier.
pub const DEFAULT_WEAK_TIER_CAPACITY: usize = 1024;

/// Default rows per ingestion batch.
pub const DEFAULT_ROW_BATCH_SIZE: usize = 100;

/// Default cap on tracked possible values per nominal column.
pub const DEFAULT_MAX_POSSIBLE_VALUES: usize = 60;

/// Default minimum free space (MB) required before creating temp files.
pub const DEFAULT_MIN_FREE_DISK_MB: u64 = 100;

/// Default number of keys the duplicate checker keeps in memory.
pub const DEFAULT_DUPLICATE_CHUNK_SIZE: usize = 100_000;

// -- Env helpers --

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid value \"{}\" for {}", raw, name);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("ignoring invalid flag \"{}\" for {}", raw, name);
            None
        }
    }
}

// ── DataCompression ─────────────────────────────────────────────────

/// Compression applied to the row stream of a spilled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataCompression {
    None,
    Gzip,
}

impl FromStr for DataCompression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DataCompression::None),
            "gzip" | "gz" => Ok(DataCompression::Gzip),
            other => Err(format!("unknown compression \"{other}\"")),
        }
    }
}

// ── BufferSettings ──────────────────────────────────────────────────

/// Per-buffer write options, persisted as the format settings block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSettings {
    pub compression: DataCompression,
    /// Whether row keys are written. Readers synthesize keys otherwise.
    pub row_keys: bool,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            compression: DataCompression::Gzip,
            row_keys: true,
        }
    }
}

// ── StoreSettings ───────────────────────────────────────────────────

/// Process-wide settings owned by `StoreContext`.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Directory for spilled buffers, blob directories and key chunks.
    pub temp_dir: PathBuf,
    /// Free space required on `temp_dir` before a temp file is created.
    pub min_free_disk_mb: u64,
    pub lru_cache_size: usize,
    pub weak_tier_capacity: usize,
    /// Threads of the shared ingestion pool.
    pub worker_threads: usize,
    /// Reclaimer thread exits after being idle this long.
    pub reclaimer_idle: Duration,
    /// Memory pressure above which `MemoryMonitor::poll` signals low memory.
    pub memory_threshold: f64,
    /// Minimum interval between cache statistics log lines.
    pub cache_stats_interval: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let tuning = TuningProfile::auto_tune();
        Self {
            temp_dir: std::env::temp_dir(),
            min_free_disk_mb: DEFAULT_MIN_FREE_DISK_MB,
            lru_cache_size: DEFAULT_LRU_CACHE_SIZE,
            weak_tier_capacity: DEFAULT_WEAK_TIER_CAPACITY,
            worker_threads: tuning.worker_threads,
            reclaimer_idle: Duration::from_secs(60),
            memory_threshold: 0.9,
            cache_stats_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl StoreSettings {
    /// Defaults with `ROWSTORE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut s = Self::default();
        if let Some(dir) = std::env::var_os("ROWSTORE_TEMP_DIR") {
            s.temp_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_value("ROWSTORE_MIN_FREE_DISK_MB") {
            s.min_free_disk_mb = v;
        }
        if let Some(v) = env_value("ROWSTORE_CACHE_SIZE") {
            s.lru_cache_size = v;
        }
        if let Some(v) = env_value::<usize>("ROWSTORE_THREADS") {
            s.worker_threads = v.max(1);
        }
        if let Some(v) = env_value("ROWSTORE_RECLAIMER_IDLE_SECS") {
            s.reclaimer_idle = Duration::from_secs(v);
        }
        if let Some(v) = env_value::<f64>("ROWSTORE_MEMORY_THRESHOLD") {
            s.memory_threshold = v.clamp(0.0, 1.0);
        }
        s
    }
}

// ── ContainerSettings ───────────────────────────────────────────────

/// Settings of one ingestion pipeline and the buffer it writes.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Resident cell budget; the row limit is `cells / columns`.
    pub max_cells_in_memory: usize,
    pub row_batch_size: usize,
    pub max_threads_per_container: usize,
    pub max_possible_values: usize,
    /// Validate and commit inline on the producer thread.
    pub sequential: bool,
    /// Copy every foreign blob into the new buffer.
    pub force_blob_copy: bool,
    /// Start domain tracking from the domain already in the schema.
    pub init_domain: bool,
    /// Register the finished table in the global repository (buffer id >= 0).
    pub track_globally: bool,
    pub duplicate_chunk_size: usize,
    pub buffer: BufferSettings,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        let tuning = TuningProfile::auto_tune();
        Self {
            max_cells_in_memory: tuning.max_cells_in_memory,
            row_batch_size: DEFAULT_ROW_BATCH_SIZE,
            max_threads_per_container: tuning.max_threads_per_container,
            max_possible_values: DEFAULT_MAX_POSSIBLE_VALUES,
            sequential: false,
            force_blob_copy: false,
            init_domain: false,
            track_globally: true,
            duplicate_chunk_size: DEFAULT_DUPLICATE_CHUNK_SIZE,
            buffer: BufferSettings::default(),
        }
    }
}

impl ContainerSettings {
    /// Defaults with `ROWSTORE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut s = Self::default();
        if let Some(v) = env_value("ROWSTORE_CELLS_IN_MEMORY") {
            s.max_cells_in_memory = v;
        }
        if let Some(v) = env_value::<usize>("ROWSTORE_BATCH_SIZE") {
            s.row_batch_size = v.max(1);
        }
        if let Some(v) = env_value::<usize>("ROWSTORE_THREADS_PER_CONTAINER") {
            s.max_threads_per_container = v.max(1);
        }
        if let Some(v) = env_value("ROWSTORE_MAX_DOMAIN_VALUES") {
            s.max_possible_values = v;
        }
        if let Some(v) = env_flag("ROWSTORE_SYNC_IO") {
            s.sequential = v;
        }
        if let Some(v) = env_value("ROWSTORE_COMPRESSION") {
            s.buffer.compression = v;
        }
        s
    }

    /// Rows a buffer with `column_count` columns keeps in memory.
    pub fn max_rows_in_memory(&self, column_count: usize) -> usize {
        if column_count == 0 {
            return self.max_cells_in_memory;
        }
        self.max_cells_in_memory / column_count
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_parse() {
        assert_eq!("GZIP".parse::<DataCompression>(), Ok(DataCompression::Gzip));
        assert_eq!("none".parse::<DataCompression>(), Ok(DataCompression::None));
        assert!("snappy".parse::<DataCompression>().is_err());
    }

    #[test]
    fn test_rows_in_memory_from_cells() {
        let s = ContainerSettings {
            max_cells_in_memory: 5_000,
            ..ContainerSettings::default()
        };
        assert_eq!(s.max_rows_in_memory(4), 1_250);
        assert_eq!(s.max_rows_in_memory(0), 5_000);
        assert_eq!(s.max_rows_in_memory(10_000), 0);
    }

    #[test]
    fn test_defaults() {
        let s = StoreSettings::default();
        assert_eq!(s.lru_cache_size, DEFAULT_LRU_CACHE_SIZE);
        assert_eq!(s.min_free_disk_mb, 100);
        assert_eq!(s.cache_stats_interval, Duration::from_secs(300));
        assert!(s.worker_threads >= 1);

        let c = ContainerSettings::default();
        assert_eq!(c.row_batch_size, 100);
        assert_eq!(c.max_possible_values, 60);
        assert!(c.buffer.row_keys);
    }
}
