//! Defaults and fixed names for segment replication

// ============================================================================
// Settings defaults
// ============================================================================

/// Idle time after which an attempt with no activity is failed
pub const DEFAULT_ACTIVITY_TIMEOUT_MS: u64 = 60_000;

/// How often the idle monitor sweeps registered attempts
pub const DEFAULT_ACTIVITY_CHECK_INTERVAL_MS: u64 = 1_000;

/// Node-wide replication bandwidth (40 MiB/s)
pub const DEFAULT_MAX_BYTES_PER_SEC: u64 = 40 * 1024 * 1024;

/// Chunk size requested by pull-mode sources
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 512 * 1024;

/// Size of the generic worker pool
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// How often a waiting attempt re-checks its cancellation token
pub const DEFAULT_TRANSFER_POLL_INTERVAL_MS: u64 = 50;

// ============================================================================
// Rate limiter
// ============================================================================

/// Never check for a pause more often than this
pub const MIN_PAUSE_CHECK_MS: u64 = 5;

/// Upper bound on bytes accumulated between pause checks
pub const MAX_PAUSE_CHECK_BYTES: u64 = 64 * 1024;

// ============================================================================
// On-disk names
// ============================================================================

/// Prefix of attempt-scoped temporary files
pub const TEMP_FILE_PREFIX: &str = "replication.";

/// Installed manifest of the last finalized checkpoint
pub const SHARD_MANIFEST_FILE_NAME: &str = "checkpoint.json";

/// Lock file held by the process owning a shard directory
pub const SHARD_LOCK_FILE_NAME: &str = "store.lock";
