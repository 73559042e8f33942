//! Default constants for MDM configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Resolution Worker Defaults
// =============================================================================

/// Default number of resolution worker threads
/// Uses number of CPU cores, capped so small hosts keep headroom for callers.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get().min(8))
        .unwrap_or(4)
}

/// Per-worker queue capacity before enqueueing applies backpressure
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Deadline for a single resolution task (milliseconds)
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 30_000;

/// Time shutdown waits for in-flight work before abandoning it (milliseconds)
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Attempts before a resolution whose inputs keep changing is given up
pub const DEFAULT_MAX_RESOLUTION_ATTEMPTS: u32 = 3;

// =============================================================================
// Locking Defaults
// =============================================================================

/// How long merge/unmerge wait for a busy master (milliseconds)
pub const DEFAULT_MERGE_LOCK_TIMEOUT_MS: u64 = 2_000;

/// Retry-after hint returned with a merge conflict (milliseconds)
pub const DEFAULT_RETRY_AFTER_MS: u64 = 250;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// Age after which a Local still lacking a master is re-enqueued (seconds)
pub const DEFAULT_UNLINKED_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// Resource Defaults
// =============================================================================

/// Matching configuration used when a resource names none
pub const DEFAULT_MATCH_CONFIGURATION: &str = "default";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "MDM_";

/// Separator between nested keys in environment variable names; single
/// underscores stay inside field names
pub const ENV_SECTION_SEPARATOR: &str = "__";
