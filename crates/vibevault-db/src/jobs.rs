//! Job store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use vibevault_core::{
    new_v7, Error, Job, JobKind, JobRepository, JobStatus, QueueStats, Result,
};

/// Column list shared by every query returning a full job row.
pub(crate) const JOB_COLUMNS: &str = "id, user_id, link_id, job_type, payload, status, attempts, \
     last_error, last_run_at, available_at, lease_owner, lease_expires_at, \
     created_at, updated_at, completed_at";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    pub(crate) fn parse_job_row(row: &PgRow) -> Result<Job> {
        let job_type: String = row.try_get("job_type")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let status: String = row.try_get("status")?;

        Ok(Job {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            link_id: row.try_get("link_id")?,
            kind: JobKind::from_parts(&job_type, payload)?,
            status: status.parse::<JobStatus>()?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            last_run_at: row.try_get("last_run_at")?,
            available_at: row.try_get("available_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn parse_rows(rows: Vec<PgRow>) -> Result<Vec<Job>> {
        let mut jobs = rows
            .iter()
            .map(Self::parse_job_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, user_id: Uuid, kind: JobKind) -> Result<Job> {
        let now = Utc::now();
        let link_id = kind.link_id();

        // One job per link: a repeat enqueue resets the existing row unless a
        // runner holds it.
        let query = format!(
            "INSERT INTO enrichment_job
                 (id, user_id, link_id, job_type, payload, status, attempts,
                  available_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'queued', 0, $6, $6, $6)
             ON CONFLICT (link_id) DO UPDATE
             SET status = 'queued', attempts = 0, job_type = EXCLUDED.job_type,
                 payload = EXCLUDED.payload, last_error = NULL,
                 available_at = EXCLUDED.available_at, lease_owner = NULL,
                 lease_expires_at = NULL, completed_at = NULL,
                 updated_at = EXCLUDED.updated_at
             WHERE enrichment_job.status <> 'running'
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(new_v7())
            .bind(user_id)
            .bind(link_id)
            .bind(kind.job_type().as_str())
            .bind(kind.payload_json()?)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_job_row(&row),
            None => Err(Error::Conflict(format!(
                "job for link {link_id} is running and cannot be re-queued"
            ))),
        }
    }

    async fn claim_batch(&self, worker_id: &str, limit: i64, lease: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();

        // FOR UPDATE SKIP LOCKED makes the claim exclusive across overlapping
        // scans and across runner instances.
        let query = format!(
            "UPDATE enrichment_job
             SET status = 'running', attempts = attempts + 1, last_run_at = $1,
                 lease_owner = $2, lease_expires_at = $3, updated_at = $1
             WHERE id IN (
                 SELECT id FROM enrichment_job
                 WHERE status = 'queued' AND available_at <= $1
                 ORDER BY created_at ASC, id ASC
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(worker_id)
            .bind(now + lease)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "jobs",
            op = "claim_batch",
            worker_id,
            job_count = rows.len(),
            "Claimed queued jobs"
        );

        Self::parse_rows(rows)
    }

    async fn claim(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let query = format!(
            "UPDATE enrichment_job
             SET status = 'running', attempts = attempts + 1, last_run_at = $1,
                 lease_owner = $2, lease_expires_at = $3, updated_at = $1
             WHERE id = $4 AND status = 'queued' AND available_at <= $1
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(worker_id)
            .bind(now + lease)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE enrichment_job
             SET status = 'completed', completed_at = $1, updated_at = $1,
                 last_error = NULL, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $2 AND status = 'running' AND lease_owner = $3",
        )
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now();

        let result = match retry_at {
            Some(retry_at) => {
                sqlx::query(
                    "UPDATE enrichment_job
                     SET status = 'queued', available_at = $1, last_error = $2,
                         updated_at = $3, lease_owner = NULL, lease_expires_at = NULL
                     WHERE id = $4 AND status = 'running' AND lease_owner = $5",
                )
                .bind(retry_at)
                .bind(error)
                .bind(now)
                .bind(job_id)
                .bind(worker_id)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE enrichment_job
                     SET status = 'failed', completed_at = $1, updated_at = $1,
                         last_error = $2, lease_owner = NULL, lease_expires_at = NULL
                     WHERE id = $3 AND status = 'running' AND lease_owner = $4",
                )
                .bind(now)
                .bind(error)
                .bind(job_id)
                .bind(worker_id)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job> {
        let now = Utc::now();
        let query = format!(
            "UPDATE enrichment_job
             SET status = 'queued',
                 attempts = CASE WHEN $1 THEN 0 ELSE attempts END,
                 available_at = $2, updated_at = $2, completed_at = NULL,
                 lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $3 AND status <> 'running'
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(reset_attempts)
            .bind(now)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_job_row(&row),
            None => match self.get(job_id).await? {
                Some(_) => Err(Error::Conflict(format!(
                    "job {job_id} is running and cannot be re-queued"
                ))),
                None => Err(Error::JobNotFound(job_id)),
            },
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM enrichment_job WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn get_for_link(&self, link_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM enrichment_job WHERE link_id = $1");
        let row = sqlx::query(&query)
            .bind(link_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM enrichment_job
             WHERE status = 'running' AND lease_expires_at < $1
             ORDER BY lease_expires_at ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn list_stale_queued(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM enrichment_job
             WHERE status = 'queued' AND updated_at < $1 AND available_at <= now()
             ORDER BY created_at ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn touch_queued(&self, job_ids: &[Uuid]) -> Result<u64> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE enrichment_job SET updated_at = now()
             WHERE id = ANY($1) AND status = 'queued'",
        )
        .bind(job_ids)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
             FROM enrichment_job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            queued: row.try_get("queued")?,
            running: row.try_get("running")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            total: row.try_get("total")?,
        })
    }
}
