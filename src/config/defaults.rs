//! Default constants for rolodex configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Apply Engine Defaults
// =============================================================================

/// Maximum operations per physical batch submitted to the store.
pub const DEFAULT_MAX_BATCH: usize = 499;

/// Attempts per save, including the first, before a version conflict
/// becomes fatal.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Batch ceiling used by the low-latency preset.
/// Smaller batches hold the store's write lock for less time.
pub const LOW_LATENCY_MAX_BATCH: usize = 100;

// =============================================================================
// Loader Defaults
// =============================================================================

/// Contact snapshots kept by one assembler for reuse.
pub const DEFAULT_CONTACT_CACHE_CAPACITY: usize = 64;

/// Upper bound on bytes read from one photo stream (16MB).
pub const DEFAULT_MAX_PHOTO_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// Worker Defaults
// =============================================================================

/// Pending requests a worker accepts before submitters block.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Name of the structural worker thread.
pub const DEFAULT_WORKER_THREAD_NAME: &str = "rolodex-worker";

/// Name of the secondary photo worker thread.
pub const DEFAULT_PHOTO_THREAD_NAME: &str = "rolodex-photo";

/// Store changes buffered per watcher before further ones are coalesced.
pub const DEFAULT_WATCH_BUFFER: usize = 16;

/// How often idle worker threads wake to check for shutdown.
pub const WORKER_POLL_INTERVAL_MS: u64 = 50;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default write buffer size in MB
pub const DEFAULT_WRITE_BUFFER_MB: usize = 16;

/// Default number of background flush and compaction jobs
pub const DEFAULT_BACKGROUND_JOBS: i32 = 2;
