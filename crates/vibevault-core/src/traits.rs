//! Repository traits implemented by the storage layer.
//!
//! The Job Store is the only synchronization point between the producer and
//! the runners, so every status transition here is conditional: callers say
//! which state (and which lease) they expect, and the store refuses stale
//! writes instead of overwriting a newer outcome.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

/// Link persistence, as consumed by the enrichment pipeline.
#[async_trait]
pub trait LinkRepository: Send + Sync {
    /// Save a new link. Fails with `Error::Conflict` when the owner already
    /// saved the same normalized URL.
    async fn create(&self, req: CreateLinkRequest) -> Result<Link>;

    /// Get a link by ID.
    async fn get(&self, link_id: Uuid) -> Result<Option<Link>>;

    /// Write enrichment results (or an enrichment failure) onto a link.
    async fn update_metadata(&self, link_id: Uuid, update: LinkMetadataUpdate) -> Result<()>;

    /// Reset enrichment status to `pending` ahead of a re-import.
    async fn mark_pending(&self, link_id: Uuid) -> Result<()>;
}

/// Persisted job store.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a job for a link.
    ///
    /// Jobs are 1:1 with links: if the link already has a job, that job is
    /// reset to `queued` with attempts back to 0 instead of inserting a row.
    /// A job that is currently `running` is left alone and the call returns
    /// [`Error::Conflict`](crate::Error::Conflict).
    async fn enqueue(&self, user_id: Uuid, kind: JobKind) -> Result<Job>;

    /// Atomically claim up to `limit` available queued jobs, oldest first.
    ///
    /// Claimed jobs are `running`, carry a lease for `worker_id`, and have had
    /// their attempt counter incremented. Concurrent callers never receive the
    /// same job.
    async fn claim_batch(&self, worker_id: &str, limit: i64, lease: Duration) -> Result<Vec<Job>>;

    /// Claim one specific job, only if it is still queued and available.
    async fn claim(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<Option<Job>>;

    /// `running → completed`, only while `worker_id` holds the lease.
    /// Returns false when the write was refused.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Record a failed attempt, only while `worker_id` holds the lease.
    ///
    /// With `retry_at` the job returns to `queued`, claimable from that time;
    /// without it the job becomes `failed`. Returns false when refused.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Explicit external re-queue of a finished job.
    ///
    /// Attempts keep counting unless `reset_attempts` is set. Running jobs
    /// cannot be re-queued (`Error::Conflict`).
    async fn requeue(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Get the job enriching a link, if any.
    async fn get_for_link(&self, link_id: Uuid) -> Result<Option<Job>>;

    /// Running jobs whose lease expired before `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Queued jobs not touched since `older_than`.
    async fn list_stale_queued(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Bump `updated_at` on the given jobs that are still queued, so a
    /// republished job is not picked up again as stale on the next sweep.
    ///
    /// Returns the number of jobs touched.
    async fn touch_queued(&self, job_ids: &[Uuid]) -> Result<u64>;

    /// Counts by status.
    async fn stats(&self) -> Result<QueueStats>;
}
