//! Default constants for bugdex configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Storage Defaults
// =============================================================================

/// Default data directory for the RocksDB backend
pub const DEFAULT_DATA_DIR: &str = "./bugdex-data";

/// Default number of universal records kept in the persistent store's read cache
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// Seconds between two full garbage collection sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Maximum tombstones followed before a chain is reported as a cycle.
/// Merge chains longer than this do not occur in practice.
pub const DEFAULT_MAX_TOMBSTONE_HOPS: usize = 64;

/// Default number of sweep worker threads.
/// Uses number of CPU cores.
pub fn default_sweep_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

// =============================================================================
// Logging Defaults
// =============================================================================

/// Filter used when neither `RUST_LOG` nor `log.filter` is set
pub const DEFAULT_LOG_FILTER: &str = "info";
