//! Structured logging field name constants.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query by the same keys across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue (job failure, lost lease, republish) |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, claims, retry decisions |
//! | TRACE | Per-field extraction detail |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "queue", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "poll_runner", "push_runner", "reconciler", "fetcher"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim_batch", "fetch", "extract", "sweep"
pub const OPERATION: &str = "op";

/// Runner instance identifier (lease owner).
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Link UUID being enriched.
pub const LINK_ID: &str = "link_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type tag.
pub const JOB_TYPE: &str = "job_type";

/// Attempt number for the current claim.
pub const ATTEMPT: &str = "attempt";

/// Target URL.
pub const URL: &str = "url";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of jobs claimed or touched.
pub const JOB_COUNT: &str = "job_count";

/// Response body length in bytes.
pub const BODY_LEN: &str = "body_len";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
