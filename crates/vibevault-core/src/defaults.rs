//! Centralized default constants for the VibeVault enrichment pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and the worker binary reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// FETCHING
// =============================================================================

/// Page fetch timeout in seconds.
pub const FETCH_TIMEOUT_SECS: u64 = 10;

/// Maximum redirects followed per fetch.
pub const FETCH_MAX_REDIRECTS: usize = 10;

/// Maximum number of body bytes kept for parsing (2 MiB).
pub const FETCH_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Browser-like user agent so sites do not reject the request as a bot.
pub const FETCH_USER_AGENT: &str = "Mozilla/5.0 (compatible; VibeVaultBot/1.0; +https://github.com/vibevault/vibevault) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Poll-runner scan interval in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Maximum jobs claimed per scan.
pub const JOB_BATCH_SIZE: i64 = 10;

/// Maximum attempts for the push runner (and `max_attempts` policies without an explicit count).
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Base delay for exponential retry backoff in milliseconds.
pub const JOB_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound on a single retry delay in milliseconds (15 minutes).
pub const JOB_BACKOFF_MAX_MS: u64 = 15 * 60 * 1_000;

/// Overall per-job execution timeout in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 60;

/// Lease granted on claim. Must exceed `JOB_TIMEOUT_SECS`.
pub const JOB_LEASE_SECS: i64 = 120;

/// Maximum concurrently executing deliveries in the push runner.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Interval between stuck-job sweeps in seconds.
pub const RECONCILE_INTERVAL_SECS: u64 = 60;

/// Age after which a still-queued job is republished to the queue, in seconds.
pub const RECONCILE_STALE_QUEUED_SECS: i64 = 300;

/// Maximum jobs touched per sweep.
pub const RECONCILE_BATCH_SIZE: i64 = 100;

// =============================================================================
// DATABASE
// =============================================================================

/// Pool size. A poll runner settles up to a full batch at once plus the scan
/// and the reconciler, so this stays above `JOB_BATCH_SIZE`.
pub const DB_MAX_CONNECTIONS: u32 = 16;

/// Connections kept open while idle.
pub const DB_MIN_CONNECTIONS: u32 = 1;

/// Seconds to wait for a free pooled connection.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds before an idle connection is closed.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

// =============================================================================
// QUEUE
// =============================================================================

/// Queue topic the producer publishes to and the push runner consumes.
pub const QUEUE_NAME: &str = "metadata";

/// Default Redis URL for the push runner.
pub const REDIS_URL: &str = "redis://localhost:6379";

/// Blocking receive timeout in seconds (bounds shutdown latency).
pub const QUEUE_RECEIVE_TIMEOUT_SECS: u64 = 1;
