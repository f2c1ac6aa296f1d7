//! System resource detection and adaptive tuning for the row store.
//!
//! Detects available RAM and CPU cores, then derives the defaults used by
//! `StoreSettings` and `ContainerSettings`: how many worker threads the
//! ingestion pool gets, how many of them a single container may occupy,
//! and how many cells a buffer keeps resident before spilling.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const GB: u64 = 1024 * 1024 * 1024;

/// Resident cell budget on small machines (< 4 GB).
const CELLS_IN_MEMORY_SMALL: usize = 5_000;

/// Resident cell budget on mid-sized machines (< 16 GB).
const CELLS_IN_MEMORY_MEDIUM: usize = 50_000;

/// Resident cell budget on large machines.
const CELLS_IN_MEMORY_LARGE: usize = 100_000;

/// Upper bound on threads a single container may use.
const MAX_THREADS_PER_CONTAINER: usize = 8;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    ///
    /// Formula: `1.0 - (available / total)`.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Defaults computed from system resources.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    /// Threads in the shared ingestion pool.
    pub worker_threads: usize,
    /// Batches one container may have in flight at once.
    pub max_threads_per_container: usize,
    /// Cells a buffer keeps in memory before spilling to disk.
    pub max_cells_in_memory: usize,
    /// Memory pressure at detection time.
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// Compute a tuning profile from detected resources.
    ///
    /// Heuristics:
    /// - `worker_threads`: `cpu_count`.
    /// - `max_threads_per_container`: `clamp(cpu_count, 1, 8)`, 1 if RAM < 2 GB.
    /// - `max_cells_in_memory`: RAM < 4 GB -> 5K, < 16 GB -> 50K, else 100K.
    pub fn from_resources(res: &SystemResources) -> Self {
        let total_gb = res.total_memory_bytes as f64 / GB as f64;
        let cpus = res.cpu_count.max(1);

        let max_threads_per_container = if res.total_memory_bytes < 2 * GB {
            1
        } else {
            cpus.clamp(1, MAX_THREADS_PER_CONTAINER)
        };

        let max_cells_in_memory = if total_gb < 4.0 {
            CELLS_IN_MEMORY_SMALL
        } else if total_gb < 16.0 {
            CELLS_IN_MEMORY_MEDIUM
        } else {
            CELLS_IN_MEMORY_LARGE
        };

        Self {
            worker_threads: cpus,
            max_threads_per_container,
            max_cells_in_memory,
            memory_pressure: res.memory_pressure(),
        }
    }

    /// Probe the system and return a tuning profile.
    pub fn auto_tune() -> Self {
        Self::from_resources(&SystemResources::detect())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_resources(total_gb: f64, available_gb: f64, cpus: usize) -> SystemResources {
        SystemResources {
            total_memory_bytes: (total_gb * GB as f64) as u64,
            available_memory_bytes: (available_gb * GB as f64) as u64,
            cpu_count: cpus,
        }
    }

    #[test]
    fn test_system_resources_detection() {
        let res = SystemResources::detect();
        assert!(res.total_memory_bytes > 0, "total memory must be positive");
        assert!(res.cpu_count >= 1, "cpu count must be at least 1");
    }

    #[test]
    fn test_tuning_low_memory_is_single_threaded() {
        let profile = TuningProfile::from_resources(&make_resources(1.0, 0.5, 8));
        assert_eq!(profile.max_threads_per_container, 1);
        assert_eq!(profile.max_cells_in_memory, CELLS_IN_MEMORY_SMALL);
        assert_eq!(profile.worker_threads, 8);
    }

    #[test]
    fn test_tuning_caps_container_threads() {
        let profile = TuningProfile::from_resources(&make_resources(64.0, 32.0, 32));
        assert_eq!(profile.max_threads_per_container, MAX_THREADS_PER_CONTAINER);
        assert_eq!(profile.max_cells_in_memory, CELLS_IN_MEMORY_LARGE);
    }

    #[test]
    fn test_tuning_medium_memory() {
        let profile = TuningProfile::from_resources(&make_resources(8.0, 4.0, 4));
        assert_eq!(profile.max_threads_per_container, 4);
        assert_eq!(profile.max_cells_in_memory, CELLS_IN_MEMORY_MEDIUM);
    }

    #[test]
    fn test_memory_pressure() {
        let res = make_resources(1.0, 0.25, 2);
        assert!((res.memory_pressure() - 0.75).abs() < 1e-9);

        let empty = make_resources(0.0, 0.0, 1);
        assert_eq!(empty.memory_pressure(), 1.0);
    }
}
