//! Stuck-job reconciliation.
//!
//! A runner that dies mid-job leaves the row `running` with a lease that
//! eventually expires. The reconciler returns such jobs to the queue (or
//! fails them when the retry policy is exhausted). In push mode it also
//! republishes jobs that have sat `queued` too long, which covers messages
//! lost between the job write and the publish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, instrument, warn};

use vibevault_core::{
    defaults, EnrichmentStatus, Job, JobRepository, LinkMetadataUpdate, LinkRepository, Result,
};

use crate::producer::JobProducer;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::worker::{WorkerEvent, WorkerHandle};

const LEASE_EXPIRED: &str = "lease expired before the job finished";

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Queued jobs untouched for this long are republished (push mode).
    pub stale_queued_after: chrono::Duration,
    pub batch_size: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(defaults::RECONCILE_INTERVAL_SECS),
            stale_queued_after: chrono::Duration::seconds(defaults::RECONCILE_STALE_QUEUED_SECS),
            batch_size: defaults::RECONCILE_BATCH_SIZE,
        }
    }
}

impl ReconcilerConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `RECONCILE_INTERVAL_SECS` | `60` |
    /// | `RECONCILE_STALE_QUEUED_SECS` | `300` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: std::env::var("RECONCILE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(defaults.interval),
            stale_queued_after: std::env::var("RECONCILE_STALE_QUEUED_SECS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.stale_queued_after),
            batch_size: defaults.batch_size,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Expired leases returned to `queued`.
    pub requeued: usize,
    /// Expired leases marked `failed`.
    pub failed: usize,
    /// Stale queued jobs republished.
    pub republished: usize,
}

/// Periodic sweeper for expired leases and lost queue messages.
pub struct Reconciler {
    jobs: Arc<dyn JobRepository>,
    links: Arc<dyn LinkRepository>,
    policy: RetryPolicy,
    config: ReconcilerConfig,
    /// Present in push mode.
    producer: Option<JobProducer>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl Reconciler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        links: Arc<dyn LinkRepository>,
        policy: RetryPolicy,
        config: ReconcilerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            jobs,
            links,
            policy,
            config,
            producer: None,
            event_tx,
        }
    }

    /// Republish through `producer` (push mode).
    pub fn with_producer(mut self, producer: JobProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> Result<ReconcileReport> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for job in self
            .jobs
            .list_expired_leases(now, self.config.batch_size)
            .await?
        {
            self.reclaim(&job, &mut report).await?;
        }

        if let Some(producer) = &self.producer {
            let stale = self
                .jobs
                .list_stale_queued(now - self.config.stale_queued_after, self.config.batch_size)
                .await?;
            for job in &stale {
                producer.signal(job).await;
            }
            if !stale.is_empty() {
                // Restart the stale clock so the next sweep skips these.
                let ids: Vec<_> = stale.iter().map(|j| j.id).collect();
                self.jobs.touch_queued(&ids).await?;
            }
            report.republished += stale.len();
        }

        if report != ReconcileReport::default() {
            info!(
                subsystem = "jobs",
                component = "reconciler",
                op = "sweep",
                requeued = report.requeued,
                failed = report.failed,
                republished = report.republished,
                "Reconciled stuck jobs"
            );
        }
        Ok(report)
    }

    async fn reclaim(&self, job: &Job, report: &mut ReconcileReport) -> Result<()> {
        let Some(owner) = job.lease_owner.as_deref() else {
            return Ok(());
        };

        match self.policy.decide(job.attempts) {
            RetryDecision::Retry { .. } => {
                // Lease expiry already waited long enough; claimable now.
                let retry_at = Some(Utc::now());
                if self.jobs.fail(job.id, owner, LEASE_EXPIRED, retry_at).await? {
                    warn!(job_id = %job.id, lease_owner = owner, "Expired lease, job re-queued");
                    report.requeued += 1;
                    if let Some(producer) = &self.producer {
                        if let Some(requeued) = self.jobs.get(job.id).await? {
                            producer.signal(&requeued).await;
                        }
                    }
                }
            }
            RetryDecision::GiveUp => {
                if self.jobs.fail(job.id, owner, LEASE_EXPIRED, None).await? {
                    warn!(job_id = %job.id, lease_owner = owner, "Expired lease, job failed");
                    report.failed += 1;
                    let _ = self.event_tx.send(WorkerEvent::JobFailed {
                        job_id: job.id,
                        job_type: job.job_type(),
                        error: LEASE_EXPIRED.to_string(),
                    });
                    self.fail_pending_link(job).await?;
                }
            }
        }
        Ok(())
    }

    /// Mark the link failed unless it already reached another outcome.
    async fn fail_pending_link(&self, job: &Job) -> Result<()> {
        match self.links.get(job.link_id).await? {
            Some(link) if link.enrichment_status == EnrichmentStatus::Pending => {
                self.links
                    .update_metadata(job.link_id, LinkMetadataUpdate::failed(LEASE_EXPIRED))
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Start sweeping on the configured interval.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        WorkerHandle::new(shutdown_tx, event_rx, task)
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            push_mode = self.producer.is_some(),
            "Reconciler started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Reconciler sweep failed");
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vibevault_core::{CreateLinkRequest, JobKind, JobStatus};
    use vibevault_db::MemoryStore;

    async fn running_job(store: &MemoryStore) -> Job {
        let link = store
            .create(CreateLinkRequest::new(
                uuid::Uuid::new_v4(),
                "https://example.com/r",
            ))
            .await
            .unwrap();
        let job = store
            .enqueue(link.user_id, JobKind::fetch_metadata(link.id, &link.url))
            .await
            .unwrap();
        let job = store
            .claim(job.id, "dead-worker", chrono::Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        store
            .set_lease_expiry(job.id, Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        job
    }

    fn reconciler(store: &MemoryStore, policy: RetryPolicy) -> Reconciler {
        Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            policy,
            ReconcilerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_expired_lease_requeued_when_attempts_remain() {
        let store = MemoryStore::new();
        let job = running_job(&store).await;

        let report = reconciler(&store, RetryPolicy::max_attempts(3))
            .sweep()
            .await
            .unwrap();
        assert_eq!(report.requeued, 1);

        let job = JobRepository::get(&store, job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_fails_job_and_pending_link() {
        let store = MemoryStore::new();
        let job = running_job(&store).await;

        let report = reconciler(&store, RetryPolicy::FailFast)
            .sweep()
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let stored = JobRepository::get(&store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let link = LinkRepository::get(&store, job.link_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.enrichment_status, EnrichmentStatus::Failed);
    }

    #[tokio::test]
    async fn test_ready_link_not_clobbered() {
        let store = MemoryStore::new();
        let job = running_job(&store).await;
        store
            .update_metadata(job.link_id, LinkMetadataUpdate::ready(Default::default()))
            .await
            .unwrap();

        reconciler(&store, RetryPolicy::FailFast)
            .sweep()
            .await
            .unwrap();
        let link = LinkRepository::get(&store, job.link_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.enrichment_status, EnrichmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_live_leases_untouched() {
        let store = MemoryStore::new();
        let job = running_job(&store).await;
        store
            .set_lease_expiry(job.id, Utc::now() + chrono::Duration::seconds(60))
            .unwrap();

        let report = reconciler(&store, RetryPolicy::FailFast)
            .sweep()
            .await
            .unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_stale_queued_job_republished_once_across_sweeps() {
        use crate::queue::{InMemoryQueue, MessageQueue};

        let store = MemoryStore::new();
        let link = store
            .create(CreateLinkRequest::new(
                uuid::Uuid::new_v4(),
                "https://example.com/s",
            ))
            .await
            .unwrap();
        let job = store
            .enqueue(link.user_id, JobKind::fetch_metadata(link.id, &link.url))
            .await
            .unwrap();
        store
            .set_updated_at(job.id, Utc::now() - chrono::Duration::minutes(10))
            .unwrap();

        let queue = InMemoryQueue::new();
        let producer = JobProducer::new(Arc::new(store.clone()), Arc::new(store.clone()))
            .with_queue(Arc::new(queue.clone()), "metadata");
        let reconciler = reconciler(&store, RetryPolicy::push_default()).with_producer(producer);
        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.republished, 1);

        let delivery = queue
            .receive("metadata", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("republished");
        assert_eq!(delivery.message.job_id, job.id);

        // The republish restarted the job's stale clock.
        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.republished, 0);
        assert!(queue
            .receive("metadata", Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());
        let stored = JobRepository::get(&store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }
}
