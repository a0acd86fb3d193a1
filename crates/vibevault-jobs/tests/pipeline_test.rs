//! End-to-end tests for the enrichment pipeline.
//!
//! These run against the in-memory store so they need no database:
//! - create link → enqueue → claim → fetch → extract → link ready
//! - poll runner with fail_fast: one failure is final
//! - push runner with max_attempts(3): three failures, then failed
//! - explicit re-queue keeps counting attempts
//! - overlapping scans never claim the same job twice
//! - a running job cannot be reset by reimport or a repeat enqueue
//! - a lease that expires mid-run is reclaimed and the late result discarded
//! - stale queued jobs are republished once, not on every sweep

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vibevault_db::MemoryStore;
use vibevault_jobs::{
    ConsumerBuilder, ConsumerConfig, CreateLinkRequest, EnrichmentStatus, Error, FetchError,
    FetcherConfig, HttpFetcher, InMemoryQueue, Job, JobContext, JobHandler, JobProducer,
    JobRepository, JobResult, JobStatus, JobType, Link, LinkRepository, MessageQueue,
    MetadataHandler, Outcome, PageFetcher, QueueMessage, ReconcileReport, Reconciler,
    ReconcilerConfig, RetryPolicy, WorkerBuilder, WorkerConfig, WorkerEvent,
};

// ============================================================================
// HELPERS
// ============================================================================

/// Fetcher that fails a fixed number of times, then serves `html`.
struct FlakyFetcher {
    failures: usize,
    html: String,
    calls: AtomicUsize,
}

impl FlakyFetcher {
    fn always_failing() -> Self {
        Self::failing_then(usize::MAX, "")
    }

    fn failing_then(failures: usize, html: &str) -> Self {
        Self {
            failures,
            html: html.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FlakyFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(FetchError::Status(500))
        } else {
            Ok(self.html.clone())
        }
    }
}

async fn create_link(store: &MemoryStore, url: &str) -> Link {
    store
        .create(CreateLinkRequest::new(Uuid::new_v4(), url))
        .await
        .expect("Failed to create test link")
}

fn producer(store: &MemoryStore) -> JobProducer {
    JobProducer::new(Arc::new(store.clone()), Arc::new(store.clone()))
}

fn metadata_handler(store: &MemoryStore, fetcher: Arc<dyn PageFetcher>) -> MetadataHandler {
    MetadataHandler::new(Arc::new(store.clone()), fetcher)
}

async fn get_job(store: &MemoryStore, job_id: Uuid) -> Job {
    JobRepository::get(store, job_id)
        .await
        .unwrap()
        .expect("job exists")
}

async fn get_link(store: &MemoryStore, link_id: Uuid) -> Link {
    LinkRepository::get(store, link_id)
        .await
        .unwrap()
        .expect("link exists")
}

/// Wait for a job to reach a specific status.
async fn wait_for_job_status(
    store: &MemoryStore,
    job_id: Uuid,
    expected_status: JobStatus,
    timeout: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if get_job(store, job_id).await.status == expected_status {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// POLL RUNNER
// ============================================================================

#[tokio::test]
async fn test_end_to_end_poll_enrichment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blog/post"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head>
                <title>Fallback</title>
                <meta property="og:title" content="The Post">
                <meta name="description" content="About things">
                <meta property="og:site_name" content="Example">
                <link rel="icon" href="/favicon.ico">
            </head><body>hi</body></html>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let link = create_link(&store, &format!("{}/blog/post", server.uri())).await;
    let job = producer(&store).on_link_created(&link).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let fetcher = Arc::new(HttpFetcher::new(FetcherConfig::default()).unwrap());
    let worker = WorkerBuilder::new(Arc::new(store.clone()))
        .with_handler(metadata_handler(&store, fetcher))
        .build();

    let outcomes = worker.scan_once().await.unwrap();
    assert_eq!(outcomes, vec![Outcome::Completed]);

    let job = get_job(&store, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());

    let link = get_link(&store, link.id).await;
    assert_eq!(link.enrichment_status, EnrichmentStatus::Ready);
    assert_eq!(link.title.as_deref(), Some("The Post"));
    assert_eq!(link.description.as_deref(), Some("About things"));
    assert_eq!(link.site_name.as_deref(), Some("Example"));
    assert_eq!(
        link.favicon,
        Some(format!("{}/favicon.ico", server.uri()))
    );
}

#[tokio::test]
async fn test_poll_fail_fast_fails_after_one_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let link = create_link(&store, &format!("{}/broken", server.uri())).await;
    let job = producer(&store).on_link_created(&link).await.unwrap();

    let fetcher = Arc::new(HttpFetcher::new(FetcherConfig::default()).unwrap());
    let worker = WorkerBuilder::new(Arc::new(store.clone()))
        .with_policy(RetryPolicy::FailFast)
        .with_handler(metadata_handler(&store, fetcher))
        .build();

    let outcomes = worker.scan_once().await.unwrap();
    assert!(matches!(outcomes.as_slice(), [Outcome::Failed { .. }]));

    let job = get_job(&store, job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("HTTP status 500"));

    let link = get_link(&store, link.id).await;
    assert_eq!(link.enrichment_status, EnrichmentStatus::Failed);
    assert_eq!(link.enrichment_error.as_deref(), Some("HTTP status 500"));

    // Nothing left to claim.
    assert!(worker.scan_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_poll_max_attempts_requeues_with_backoff() {
    let store = MemoryStore::new();
    let link = create_link(&store, "https://example.com/flaky").await;
    let job = producer(&store).on_link_created(&link).await.unwrap();

    let fetcher = Arc::new(FlakyFetcher::failing_then(1, "<title>Back</title>"));
    let worker = WorkerBuilder::new(Arc::new(store.clone()))
        .with_policy(RetryPolicy::MaxAttempts {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
        })
        .with_handler(metadata_handler(&store, fetcher.clone()))
        .build();

    let outcomes = worker.scan_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![Outcome::Retrying {
            delay: Duration::from_millis(50)
        }]
    );
    let queued = get_job(&store, job.id).await;
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.last_error.as_deref(), Some("HTTP status 500"));
    assert!(queued.lease_owner.is_none());

    // Not claimable until the backoff elapses.
    assert!(worker.scan_once().await.unwrap().is_empty());
    sleep(Duration::from_millis(80)).await;

    assert_eq!(worker.scan_once().await.unwrap(), vec![Outcome::Completed]);
    assert_eq!(get_job(&store, job.id).await.attempts, 2);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(
        get_link(&store, link.id).await.title.as_deref(),
        Some("Back")
    );
}

#[tokio::test]
async fn test_requeue_continues_attempt_count() {
    let store = MemoryStore::new();
    let link = create_link(&store, "https://example.com/retry-later").await;
    let producer = producer(&store);
    let job = producer.on_link_created(&link).await.unwrap();

    let fetcher = Arc::new(FlakyFetcher::failing_then(1, "<title>Second time</title>"));
    let worker = WorkerBuilder::new(Arc::new(store.clone()))
        .with_handler(metadata_handler(&store, fetcher))
        .build();

    worker.scan_once().await.unwrap();
    assert_eq!(get_job(&store, job.id).await.status, JobStatus::Failed);

    let requeued = producer.requeue(job.id, false).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(
        get_link(&store, link.id).await.enrichment_status,
        EnrichmentStatus::Pending
    );

    assert_eq!(worker.scan_once().await.unwrap(), vec![Outcome::Completed]);
    let done = get_job(&store, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(
        get_link(&store, link.id).await.enrichment_status,
        EnrichmentStatus::Ready
    );
}

/// Handler counting how often each job runs.
struct CountingHandler {
    runs: Arc<Mutex<HashMap<Uuid, usize>>>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn job_type(&self) -> JobType {
        JobType::FetchMetadata
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        sleep(Duration::from_millis(5)).await;
        *self.runs.lock().unwrap().entry(ctx.job.id).or_insert(0) += 1;
        JobResult::Success(None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_scans_never_double_claim() {
    let store = MemoryStore::new();
    let producer = producer(&store);
    for i in 0..40 {
        let link = create_link(&store, &format!("https://example.com/{i}")).await;
        producer.on_link_created(&link).await.unwrap();
    }

    let runs = Arc::new(Mutex::new(HashMap::new()));
    let workers: Vec<_> = (0..4)
        .map(|i| {
            Arc::new(
                WorkerBuilder::new(Arc::new(store.clone()))
                    .with_config(
                        WorkerConfig::default()
                            .with_batch_size(3)
                            .with_worker_id(format!("w{i}")),
                    )
                    .with_handler(CountingHandler { runs: runs.clone() })
                    .build(),
            )
        })
        .collect();

    let mut scans = Vec::new();
    for _ in 0..5 {
        for worker in &workers {
            let worker = worker.clone();
            scans.push(tokio::spawn(async move { worker.scan_once().await.unwrap() }));
        }
    }
    for scan in scans {
        scan.await.unwrap();
    }

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 40);
    assert!(runs.values().all(|&n| n == 1), "a job ran twice: {runs:?}");
    assert_eq!(store.stats().await.unwrap().completed, 40);
}

#[tokio::test]
async fn test_started_worker_processes_and_shuts_down() {
    let store = MemoryStore::new();
    let link = create_link(&store, "https://example.com/live").await;
    let job = producer(&store).on_link_created(&link).await.unwrap();

    let fetcher = Arc::new(FlakyFetcher::failing_then(0, "<title>Live</title>"));
    let handle = WorkerBuilder::new(Arc::new(store.clone()))
        .with_config(WorkerConfig::default().with_poll_interval(20))
        .with_handler(metadata_handler(&store, fetcher))
        .build()
        .start();
    let mut events = handle.events();

    assert!(
        wait_for_job_status(&store, job.id, JobStatus::Completed, Duration::from_secs(5)).await
    );
    handle.shutdown().await.unwrap();

    let mut saw_completed = false;
    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkerEvent::JobCompleted { job_id, .. } if job_id == job.id => saw_completed = true,
            WorkerEvent::WorkerStopped => saw_stopped = true,
            _ => {}
        }
    }
    assert!(saw_completed);
    assert!(saw_stopped);
}

#[tokio::test]
async fn test_job_timeout_recorded_as_failure() {
    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        fn job_type(&self) -> JobType {
            JobType::FetchMetadata
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            sleep(Duration::from_secs(5)).await;
            JobResult::Success(None)
        }
    }

    let store = MemoryStore::new();
    let link = create_link(&store, "https://example.com/slow").await;
    let job = producer(&store).on_link_created(&link).await.unwrap();

    let worker = WorkerBuilder::new(Arc::new(store.clone()))
        .with_config(WorkerConfig::default().with_job_timeout(Duration::from_millis(50)))
        .with_handler(SlowHandler)
        .build();

    let outcomes = worker.scan_once().await.unwrap();
    assert!(matches!(outcomes.as_slice(), [Outcome::Failed { error }] if error.contains("timeout")));
    assert_eq!(get_job(&store, job.id).await.status, JobStatus::Failed);
}

/// Handler that parks inside `execute` until released.
struct GatedHandler {
    started: Arc<Notify>,
    release: Arc<Notify>,
    fail: bool,
}

impl GatedHandler {
    fn new(fail: bool) -> (Self, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let handler = Self {
            started: started.clone(),
            release: release.clone(),
            fail,
        };
        (handler, started, release)
    }
}

#[async_trait]
impl JobHandler for GatedHandler {
    fn job_type(&self) -> JobType {
        JobType::FetchMetadata
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        self.started.notify_one();
        self.release.notified().await;
        if self.fail {
            JobResult::Failed("HTTP status 500".into())
        } else {
            JobResult::Success(None)
        }
    }
}

#[tokio::test]
async fn test_running_job_survives_reimport() {
    let store = MemoryStore::new();
    let link = create_link(&store, "https://example.com/busy").await;
    let producer = producer(&store);
    let job = producer.on_link_created(&link).await.unwrap();

    let (handler, started, release) = GatedHandler::new(false);
    let worker = Arc::new(
        WorkerBuilder::new(Arc::new(store.clone()))
            .with_handler(handler)
            .build(),
    );
    let scan = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.scan_once().await.unwrap() })
    };
    started.notified().await;

    assert!(matches!(
        producer.reimport(link.id).await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        producer.on_link_created(&link).await,
        Err(Error::Conflict(_))
    ));
    let held = get_job(&store, job.id).await;
    assert_eq!(held.status, JobStatus::Running);
    assert_eq!(held.attempts, 1);

    // A second runner finds nothing to claim.
    let other = WorkerBuilder::new(Arc::new(store.clone()))
        .with_config(WorkerConfig::default().with_worker_id("other"))
        .with_handler(CountingHandler {
            runs: Arc::new(Mutex::new(HashMap::new())),
        })
        .build();
    assert!(other.scan_once().await.unwrap().is_empty());

    release.notify_one();
    assert_eq!(scan.await.unwrap(), vec![Outcome::Completed]);
    let done = get_job(&store, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 1);
}

#[tokio::test]
async fn test_lease_expired_mid_run_discards_late_result() {
    for fail in [false, true] {
        let store = MemoryStore::new();
        let link = create_link(&store, "https://example.com/stuck").await;
        let job = producer(&store).on_link_created(&link).await.unwrap();

        let (handler, started, release) = GatedHandler::new(fail);
        let worker = Arc::new(
            WorkerBuilder::new(Arc::new(store.clone()))
                .with_handler(handler)
                .build(),
        );
        let scan = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.scan_once().await.unwrap() })
        };
        started.notified().await;

        store
            .set_lease_expiry(job.id, chrono::Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            RetryPolicy::max_attempts(3),
            ReconcilerConfig::default(),
        );
        let report = reconciler.sweep().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                requeued: 1,
                ..Default::default()
            }
        );

        let requeued = get_job(&store, job.id).await;
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.lease_owner.is_none());
        assert!(store
            .claim(job.id, "w2", chrono::Duration::seconds(60))
            .await
            .unwrap()
            .is_some());

        release.notify_one();
        assert_eq!(scan.await.unwrap(), vec![Outcome::LeaseLost], "fail={fail}");

        // The new owner's run is untouched by the late result.
        let current = get_job(&store, job.id).await;
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.lease_owner.as_deref(), Some("w2"));
        assert_eq!(current.attempts, 2);
        assert_eq!(
            get_link(&store, link.id).await.enrichment_status,
            EnrichmentStatus::Pending
        );
    }
}

// ============================================================================
// PUSH RUNNER
// ============================================================================

fn push_policy() -> RetryPolicy {
    RetryPolicy::MaxAttempts {
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
    }
}

fn push_config() -> ConsumerConfig {
    ConsumerConfig::default().with_receive_timeout(Duration::from_millis(50))
}

#[tokio::test]
async fn test_push_three_failures_end_in_failed() {
    let store = MemoryStore::new();
    let queue = InMemoryQueue::new();
    let link = create_link(&store, "https://example.com/down").await;
    let job = producer(&store)
        .with_queue(Arc::new(queue.clone()), "metadata")
        .on_link_created(&link)
        .await
        .unwrap();

    let fetcher = Arc::new(FlakyFetcher::always_failing());
    let handle = ConsumerBuilder::new(Arc::new(store.clone()), Arc::new(queue.clone()))
        .with_config(push_config())
        .with_policy(push_policy())
        .with_handler(metadata_handler(&store, fetcher.clone()))
        .build()
        .start();

    assert!(
        wait_for_job_status(&store, job.id, JobStatus::Failed, Duration::from_secs(5)).await,
        "job should end failed"
    );
    handle.shutdown().await.unwrap();

    let job = get_job(&store, job.id).await;
    assert_eq!(job.attempts, 3);
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(
        get_link(&store, link.id).await.enrichment_status,
        EnrichmentStatus::Failed
    );
    assert_eq!(queue.in_flight().await, 0);
}

#[tokio::test]
async fn test_push_success_after_retry() {
    let store = MemoryStore::new();
    let queue = InMemoryQueue::new();
    let link = create_link(&store, "https://example.com/wobbly").await;
    let job = producer(&store)
        .with_queue(Arc::new(queue.clone()), "metadata")
        .on_link_created(&link)
        .await
        .unwrap();

    let fetcher = Arc::new(FlakyFetcher::failing_then(2, "<title>Finally</title>"));
    let handle = ConsumerBuilder::new(Arc::new(store.clone()), Arc::new(queue.clone()))
        .with_config(push_config())
        .with_policy(push_policy())
        .with_handler(metadata_handler(&store, fetcher))
        .build()
        .start();

    assert!(
        wait_for_job_status(&store, job.id, JobStatus::Completed, Duration::from_secs(5)).await
    );
    handle.shutdown().await.unwrap();

    assert_eq!(get_job(&store, job.id).await.attempts, 3);
    assert_eq!(
        get_link(&store, link.id).await.title.as_deref(),
        Some("Finally")
    );
}

#[tokio::test]
async fn test_push_duplicate_delivery_is_dropped() {
    let store = MemoryStore::new();
    let queue = InMemoryQueue::new();
    let link = create_link(&store, "https://example.com/dup").await;
    let job = producer(&store).on_link_created(&link).await.unwrap();

    let message = QueueMessage::for_job(&job);
    queue.publish("metadata", &message).await.unwrap();
    queue.publish("metadata", &message).await.unwrap();

    let fetcher = Arc::new(FlakyFetcher::failing_then(0, "<title>Once</title>"));
    let consumer = ConsumerBuilder::new(Arc::new(store.clone()), Arc::new(queue.clone()))
        .with_config(push_config())
        .with_handler(metadata_handler(&store, fetcher.clone()))
        .build();

    let first = queue
        .receive("metadata", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        consumer.process(first).await.unwrap(),
        Some(Outcome::Completed)
    );

    let second = queue
        .receive("metadata", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consumer.process(second).await.unwrap(), None);

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(get_job(&store, job.id).await.attempts, 1);
    assert_eq!(queue.in_flight().await, 0);
}

#[tokio::test]
async fn test_stale_job_republished_once_then_processed() {
    let store = MemoryStore::new();
    let queue = InMemoryQueue::new();
    let link = create_link(&store, "https://example.com/lost").await;
    // Written without a queue signal, as if the publish had been lost.
    let job = producer(&store).on_link_created(&link).await.unwrap();
    store
        .set_updated_at(job.id, chrono::Utc::now() - chrono::Duration::minutes(10))
        .unwrap();

    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        push_policy(),
        ReconcilerConfig::default(),
    )
    .with_producer(producer(&store).with_queue(Arc::new(queue.clone()), "metadata"));

    assert_eq!(reconciler.sweep().await.unwrap().republished, 1);
    assert_eq!(reconciler.sweep().await.unwrap().republished, 0);

    let fetcher = Arc::new(FlakyFetcher::failing_then(0, "<title>Found</title>"));
    let consumer = ConsumerBuilder::new(Arc::new(store.clone()), Arc::new(queue.clone()))
        .with_config(push_config())
        .with_policy(push_policy())
        .with_handler(metadata_handler(&store, fetcher.clone()))
        .build();

    let delivery = queue
        .receive("metadata", Duration::from_millis(50))
        .await
        .unwrap()
        .expect("republished once");
    assert_eq!(
        consumer.process(delivery).await.unwrap(),
        Some(Outcome::Completed)
    );
    assert!(queue
        .receive("metadata", Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(
        get_link(&store, link.id).await.title.as_deref(),
        Some("Found")
    );
}
