//! Job handlers for each job type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};
use uuid::Uuid;

use vibevault_core::{Job, JobKind, JobType, LinkMetadataUpdate, LinkRepository};

use crate::extractor::extract;
use crate::fetcher::PageFetcher;

/// Handlers keyed by the job type they process.
pub type HandlerRegistry = HashMap<JobType, Arc<dyn JobHandler>>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The claimed job. `attempts` already counts this run.
    pub job: Job,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// Get the link ID for this job.
    pub fn link_id(&self) -> Uuid {
        self.job.link_id
    }

    /// Get the typed job payload.
    pub fn kind(&self) -> &JobKind {
        &self.job.kind
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }
}

/// Result of job execution.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Job failed and another attempt cannot help.
    Failed(String),
    /// Job failed; the retry policy decides whether to try again.
    Retry(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler processes.
    fn job_type(&self) -> JobType;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called once when a job of this type is finally marked failed.
    async fn on_failed(&self, _job: &Job, _error: &str) {}

    /// Check if this handler can process the given job type.
    fn can_handle(&self, job_type: JobType) -> bool {
        self.job_type() == job_type
    }
}

/// Fetches a link's page, extracts metadata, and writes it onto the link.
pub struct MetadataHandler {
    links: Arc<dyn LinkRepository>,
    fetcher: Arc<dyn PageFetcher>,
}

impl MetadataHandler {
    pub fn new(links: Arc<dyn LinkRepository>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { links, fetcher }
    }
}

#[async_trait]
impl JobHandler for MetadataHandler {
    fn job_type(&self) -> JobType {
        JobType::FetchMetadata
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let JobKind::FetchMetadata(payload) = ctx.kind();
        let start = Instant::now();

        match self.links.get(payload.link_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return JobResult::Failed(format!("link {} no longer exists", payload.link_id))
            }
            Err(e) => return JobResult::Retry(e.to_string()),
        }

        let html = match self.fetcher.fetch(&payload.url).await {
            Ok(html) => html,
            Err(e) if e.is_retryable() => return JobResult::Retry(e.to_string()),
            Err(e) => return JobResult::Failed(e.to_string()),
        };

        let metadata = extract(&html, &payload.url);
        debug!(
            subsystem = "jobs",
            component = "metadata",
            op = "extract",
            link_id = %payload.link_id,
            body_len = html.len(),
            has_title = metadata.title.is_some(),
            has_favicon = metadata.favicon.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Extracted page metadata"
        );

        let result = serde_json::to_value(&metadata).ok();
        if let Err(e) = self
            .links
            .update_metadata(payload.link_id, LinkMetadataUpdate::ready(metadata))
            .await
        {
            return JobResult::Retry(format!("failed to store metadata: {e}"));
        }

        JobResult::Success(result)
    }

    async fn on_failed(&self, job: &Job, error: &str) {
        match self
            .links
            .update_metadata(job.link_id, LinkMetadataUpdate::failed(error))
            .await
        {
            Ok(()) => {}
            Err(vibevault_core::Error::LinkNotFound(_)) => {
                warn!(
                    link_id = %job.link_id,
                    job_id = %job.id,
                    "Link gone before failure was recorded"
                );
            }
            Err(e) => {
                error!(
                    error = %e,
                    link_id = %job.link_id,
                    job_id = %job.id,
                    "Failed to mark link as failed"
                );
            }
        }
    }
}
