//! Job producer: turns link lifecycle events into queued jobs.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use vibevault_core::{
    Error, Job, JobKind, JobRepository, JobStatus, Link, LinkRepository, Result,
};

use crate::queue::{MessageQueue, QueueMessage};

/// Queue signal published alongside each queued job (push mode only).
#[derive(Clone)]
pub struct QueueSignal {
    pub queue: Arc<dyn MessageQueue>,
    pub queue_name: String,
}

/// Writes enrichment jobs for links.
#[derive(Clone)]
pub struct JobProducer {
    jobs: Arc<dyn JobRepository>,
    links: Arc<dyn LinkRepository>,
    signal: Option<QueueSignal>,
}

impl JobProducer {
    /// Producer for poll mode: the job row is the only signal.
    pub fn new(jobs: Arc<dyn JobRepository>, links: Arc<dyn LinkRepository>) -> Self {
        Self {
            jobs,
            links,
            signal: None,
        }
    }

    /// Also publish a queue message for every queued job.
    pub fn with_queue(
        mut self,
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        self.signal = Some(QueueSignal {
            queue,
            queue_name: queue_name.into(),
        });
        self
    }

    /// Queue a metadata fetch for a newly created link.
    ///
    /// A link that already has a job gets that job reset rather than a second
    /// one. A job that is still running yields [`Error::Conflict`].
    pub async fn on_link_created(&self, link: &Link) -> Result<Job> {
        let job = self
            .jobs
            .enqueue(link.user_id, JobKind::fetch_metadata(link.id, link.url.clone()))
            .await?;

        info!(
            subsystem = "jobs",
            component = "producer",
            op = "enqueue",
            job_id = %job.id,
            link_id = %link.id,
            url = %link.url,
            "Queued metadata job"
        );
        self.signal(&job).await;
        Ok(job)
    }

    /// Explicitly re-queue a finished job.
    ///
    /// The link goes back to `pending`; attempts keep counting unless
    /// `reset_attempts` is set.
    pub async fn requeue(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job> {
        let job = self.jobs.requeue(job_id, reset_attempts).await?;
        match self.links.mark_pending(job.link_id).await {
            Ok(()) | Err(Error::LinkNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(
            subsystem = "jobs",
            component = "producer",
            op = "requeue",
            job_id = %job.id,
            link_id = %job.link_id,
            attempt = job.attempts,
            reset_attempts,
            "Re-queued job"
        );
        self.signal(&job).await;
        Ok(job)
    }

    /// Reset a re-imported link to `pending` and queue it again.
    ///
    /// Refused with [`Error::Conflict`] while a runner holds the link's job;
    /// the link is left untouched in that case.
    pub async fn reimport(&self, link_id: Uuid) -> Result<Job> {
        let link = self
            .links
            .get(link_id)
            .await?
            .ok_or(Error::LinkNotFound(link_id))?;
        if let Some(job) = self.jobs.get_for_link(link_id).await? {
            if job.status == JobStatus::Running {
                return Err(Error::Conflict(format!(
                    "job {} for link {link_id} is running",
                    job.id
                )));
            }
        }
        self.links.mark_pending(link_id).await?;
        self.on_link_created(&link).await
    }

    /// Publish the queue signal for `job`, if configured.
    ///
    /// Failures are logged only; the reconciler republishes stale jobs.
    pub async fn signal(&self, job: &Job) {
        let Some(signal) = &self.signal else {
            return;
        };
        if let Err(e) = signal
            .queue
            .publish(&signal.queue_name, &QueueMessage::for_job(job))
            .await
        {
            warn!(
                subsystem = "jobs",
                component = "producer",
                error = %e,
                job_id = %job.id,
                "Failed to publish queue message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vibevault_core::{CreateLinkRequest, EnrichmentStatus, LinkMetadataUpdate};
    use vibevault_db::MemoryStore;

    use crate::queue::InMemoryQueue;

    async fn setup() -> (MemoryStore, JobProducer, Link) {
        let store = MemoryStore::new();
        let link = store
            .create(CreateLinkRequest::new(Uuid::new_v4(), "https://example.com/a"))
            .await
            .unwrap();
        let producer = JobProducer::new(Arc::new(store.clone()), Arc::new(store.clone()));
        (store, producer, link)
    }

    #[tokio::test]
    async fn test_on_link_created_queues_one_job() {
        let (store, producer, link) = setup().await;
        let job = producer.on_link_created(&link).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.link_id, link.id);

        // Same link again: same job, not a second row.
        let again = producer.on_link_created(&link).await.unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_push_mode_publishes_message() {
        let (store, _, link) = setup().await;
        let queue = InMemoryQueue::new();
        let producer = JobProducer::new(Arc::new(store.clone()), Arc::new(store))
            .with_queue(Arc::new(queue.clone()), "metadata");

        let job = producer.on_link_created(&link).await.unwrap();
        let delivery = queue
            .receive("metadata", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("message published");
        assert_eq!(delivery.message.job_id, job.id);
        assert_eq!(delivery.message.url, link.url);
    }

    #[tokio::test]
    async fn test_reimport_resets_link_to_pending() {
        let (store, producer, link) = setup().await;
        store
            .update_metadata(link.id, LinkMetadataUpdate::failed("HTTP status 404"))
            .await
            .unwrap();

        let job = producer.reimport(link.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let link = LinkRepository::get(&store, link.id).await.unwrap().unwrap();
        assert_eq!(link.enrichment_status, EnrichmentStatus::Pending);
        assert!(link.enrichment_error.is_none());

        assert!(matches!(
            producer.reimport(Uuid::new_v4()).await,
            Err(Error::LinkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_running_job_is_not_reset_by_reimport_or_enqueue() {
        let (store, producer, link) = setup().await;
        let job = producer.on_link_created(&link).await.unwrap();
        let lease = chrono::Duration::seconds(60);
        store.claim(job.id, "w1", lease).await.unwrap().unwrap();

        assert!(matches!(
            producer.reimport(link.id).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            producer.on_link_created(&link).await,
            Err(Error::Conflict(_))
        ));

        let held = store.get_for_link(link.id).await.unwrap().unwrap();
        assert_eq!(held.status, JobStatus::Running);
        assert_eq!(held.attempts, 1);
        assert_eq!(held.lease_owner.as_deref(), Some("w1"));

        assert!(store.claim(job.id, "w2", lease).await.unwrap().is_none());
        assert!(store.complete(job.id, "w1").await.unwrap());

        // Finished jobs can be re-imported again.
        let again = producer.reimport(link.id).await.unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.status, JobStatus::Queued);
        assert_eq!(again.attempts, 0);
    }
}
