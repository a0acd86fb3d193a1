//! In-memory job and link store.
//!
//! Implements the same repository traits as the PostgreSQL layer, with the
//! same conditional-transition semantics, behind a single mutex. Used by
//! runner tests and for running the pipeline without a database.
//!
//! ## Usage
//!
//! ```rust
//! use vibevault_db::memory::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let links = store.clone(); // LinkRepository
//! let jobs = store;          // JobRepository, same state
//! # let _ = (links, jobs);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use vibevault_core::{
    extract_domain, new_v7, normalize_url, parse_link_url, CreateLinkRequest, EnrichmentStatus,
    Error, Job, JobKind, JobRepository, JobStatus, Link, LinkMetadataUpdate, LinkRepository,
    QueueStats, Result,
};

#[derive(Default)]
struct MemoryState {
    links: HashMap<Uuid, Link>,
    jobs: HashMap<Uuid, Job>,
}

/// Shared-state store; clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    /// Snapshot of every job, oldest first.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Overwrite a job's lease expiry, e.g. to simulate a crashed runner.
    pub fn set_lease_expiry(&self, job_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        job.lease_expires_at = Some(expires_at);
        Ok(())
    }

    /// Overwrite a job's `updated_at`, e.g. to age a queued job.
    pub fn set_updated_at(&self, job_id: Uuid, updated_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        job.updated_at = updated_at;
        Ok(())
    }

    fn claim_locked(job: &mut Job, worker_id: &str, lease: Duration, now: DateTime<Utc>) -> Job {
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.last_run_at = Some(now);
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + lease);
        job.updated_at = now;
        job.clone()
    }

    fn holds_lease(job: &Job, worker_id: &str) -> bool {
        job.status == JobStatus::Running && job.lease_owner.as_deref() == Some(worker_id)
    }
}

#[async_trait]
impl LinkRepository for MemoryStore {
    async fn create(&self, req: CreateLinkRequest) -> Result<Link> {
        let parsed = parse_link_url(&req.url)?;
        let normalized_url = normalize_url(parsed.as_str());
        let mut state = self.lock()?;

        if state
            .links
            .values()
            .any(|l| l.user_id == req.user_id && l.normalized_url == normalized_url)
        {
            return Err(Error::Conflict(format!(
                "link already saved: {normalized_url}"
            )));
        }

        let now = Utc::now();
        let link = Link {
            id: new_v7(),
            user_id: req.user_id,
            url: req.url.clone(),
            normalized_url,
            domain: extract_domain(parsed.as_str()),
            title: req.title,
            description: req.description,
            note: req.note,
            image: None,
            favicon: None,
            site_name: None,
            published_time: None,
            enrichment_status: EnrichmentStatus::Pending,
            enrichment_error: None,
            created_at: now,
            updated_at: now,
        };
        state.links.insert(link.id, link.clone());
        Ok(link)
    }

    async fn get(&self, link_id: Uuid) -> Result<Option<Link>> {
        Ok(self.lock()?.links.get(&link_id).cloned())
    }

    async fn update_metadata(&self, link_id: Uuid, update: LinkMetadataUpdate) -> Result<()> {
        let mut state = self.lock()?;
        let link = state
            .links
            .get_mut(&link_id)
            .ok_or(Error::LinkNotFound(link_id))?;

        if let Some(meta) = update.metadata {
            link.title = meta.title.or(link.title.take());
            link.description = meta.description.or(link.description.take());
            link.site_name = meta.site_name.or(link.site_name.take());
            link.image = meta.image.or(link.image.take());
            link.favicon = meta.favicon.or(link.favicon.take());
            link.published_time = meta.published_time.or(link.published_time);
        }
        link.enrichment_status = update.enrichment_status;
        link.enrichment_error = update.enrichment_error;
        link.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_pending(&self, link_id: Uuid) -> Result<()> {
        let mut state = self.lock()?;
        let link = state
            .links
            .get_mut(&link_id)
            .ok_or(Error::LinkNotFound(link_id))?;
        link.enrichment_status = EnrichmentStatus::Pending;
        link.enrichment_error = None;
        link.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(&self, user_id: Uuid, kind: JobKind) -> Result<Job> {
        let now = Utc::now();
        let link_id = kind.link_id();
        let mut state = self.lock()?;

        if let Some(job) = state.jobs.values_mut().find(|j| j.link_id == link_id) {
            if job.status == JobStatus::Running {
                return Err(Error::Conflict(format!(
                    "job for link {link_id} is running and cannot be re-queued"
                )));
            }
            job.kind = kind;
            job.status = JobStatus::Queued;
            job.attempts = 0;
            job.last_error = None;
            job.available_at = now;
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.completed_at = None;
            job.updated_at = now;
            return Ok(job.clone());
        }

        let job = Job {
            id: new_v7(),
            user_id,
            link_id,
            kind,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            last_run_at: None,
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_batch(&self, worker_id: &str, limit: i64, lease: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let mut candidates: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Queued && j.available_at <= now)
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| Self::claim_locked(job, worker_id, lease, now))
            .collect())
    }

    async fn claim(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.lock()?;
        Ok(state
            .jobs
            .get_mut(&job_id)
            .filter(|j| j.status == JobStatus::Queued && j.available_at <= now)
            .map(|job| Self::claim_locked(job, worker_id, lease, now)))
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if Self::holds_lease(job, worker_id) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.updated_at = now;
                job.last_error = None;
                job.lease_owner = None;
                job.lease_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if Self::holds_lease(job, worker_id) => {
                match retry_at {
                    Some(at) => {
                        job.status = JobStatus::Queued;
                        job.available_at = at;
                    }
                    None => {
                        job.status = JobStatus::Failed;
                        job.completed_at = Some(now);
                    }
                }
                job.last_error = Some(error.to_string());
                job.updated_at = now;
                job.lease_owner = None;
                job.lease_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;

        if job.status == JobStatus::Running {
            return Err(Error::Conflict(format!(
                "job {job_id} is running and cannot be re-queued"
            )));
        }

        job.status = JobStatus::Queued;
        if reset_attempts {
            job.attempts = 0;
        }
        job.available_at = now;
        job.updated_at = now;
        job.completed_at = None;
        job.lease_owner = None;
        job.lease_expires_at = None;
        Ok(job.clone())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn get_for_link(&self, link_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .find(|j| j.link_id == link_id)
            .cloned())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs()?
            .into_iter()
            .filter(|j| {
                j.status == JobStatus::Running && j.lease_expires_at.is_some_and(|t| t < now)
            })
            .collect();
        jobs.sort_by_key(|j| j.lease_expires_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_stale_queued(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut jobs: Vec<Job> = self
            .jobs()?
            .into_iter()
            .filter(|j| {
                j.status == JobStatus::Queued && j.updated_at < older_than && j.available_at <= now
            })
            .collect();
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn touch_queued(&self, job_ids: &[Uuid]) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let mut touched = 0;
        for id in job_ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.status == JobStatus::Queued {
                    job.updated_at = now;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.lock()?;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }
}
