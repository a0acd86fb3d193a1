//! Poll runner: a scheduler that scans the job store on a fixed cadence.
//!
//! Every tick spawns a scan without waiting for earlier scans to finish, so
//! scans may overlap. Overlap is safe because claims are atomic in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use vibevault_core::{defaults, JobRepository, JobType, Result};

use crate::executor::{JobExecutor, Outcome};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::retry::RetryPolicy;

/// Configuration for the poll runner.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Scan interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum jobs claimed per scan.
    pub batch_size: i64,
    /// Overall per-job timeout.
    pub job_timeout: Duration,
    /// Lease granted on claim.
    pub lease: chrono::Duration,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Identity stamped on leases.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            batch_size: defaults::JOB_BATCH_SIZE,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            lease: chrono::Duration::seconds(defaults::JOB_LEASE_SECS),
            enabled: true,
            worker_id: generate_worker_id("poll"),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Scan cadence |
    /// | `JOB_BATCH_SIZE` | `10` | Jobs claimed per scan |
    /// | `JOB_TIMEOUT_SECS` | `60` | Per-job timeout |
    /// | `JOB_LEASE_SECS` | `120` | Lease granted on claim |
    /// | `WORKER_ID` | random | Lease owner identity |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.poll_interval_ms)
            .max(1);

        let batch_size = std::env::var("JOB_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults.batch_size)
            .max(1);

        let job_timeout = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_timeout);

        let lease = std::env::var("JOB_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(chrono::Duration::seconds)
            .unwrap_or(defaults.lease);

        Self {
            poll_interval_ms,
            batch_size,
            job_timeout,
            lease,
            enabled,
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the maximum jobs claimed per scan.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the lease owner identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// `<prefix>-<8 hex chars>`, unique per process start.
pub fn generate_worker_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

/// Event emitted by the runners.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job was started.
    JobStarted {
        job_id: Uuid,
        job_type: JobType,
        attempt: i32,
    },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, job_type: JobType },
    /// A job attempt failed and the job was re-queued.
    JobRetrying {
        job_id: Uuid,
        job_type: JobType,
        attempt: i32,
        delay: Duration,
        error: String,
    },
    /// A job failed for good.
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
    },
    /// A poll scan finished processing its batch.
    ScanCompleted { claimed: usize },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        shutdown_tx: mpsc::Sender<()>,
        event_rx: broadcast::Receiver<WorkerEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            shutdown_tx,
            event_rx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Signal the worker to stop and wait until in-flight work has drained.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        // The loop may already have exited on its own.
        let _ = self.shutdown_tx.send(()).await;
        task.await.map_err(|e| {
            vibevault_core::Error::Internal(format!("Worker task failed: {e}"))
        })
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Poll runner over the job store.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    config: WorkerConfig,
    executor: JobExecutor,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        config: WorkerConfig,
        policy: RetryPolicy,
        handlers: HandlerRegistry,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let executor = JobExecutor::new(
            jobs.clone(),
            Arc::new(handlers),
            policy,
            config.worker_id.clone(),
            config.job_timeout,
            event_tx.clone(),
        );
        Self {
            jobs,
            config,
            executor,
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        let task = tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        });

        WorkerHandle::new(shutdown_tx, event_rx, task)
    }

    /// Claim one batch and process it concurrently.
    ///
    /// Returns the outcome of every claimed job.
    pub async fn scan_once(&self) -> Result<Vec<Outcome>> {
        let claimed = self
            .jobs
            .claim_batch(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.lease,
            )
            .await?;

        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            subsystem = "jobs",
            component = "poll",
            op = "scan",
            worker_id = %self.config.worker_id,
            job_count = claimed.len(),
            "Processing claimed batch"
        );

        let count = claimed.len();
        let outcomes = join_all(claimed.into_iter().map(|job| self.executor.run(job))).await;
        let _ = self
            .event_tx
            .send(WorkerEvent::ScanCompleted { claimed: count });
        Ok(outcomes)
    }

    #[instrument(skip(self, shutdown_rx), fields(worker_id = %self.config.worker_id))]
    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            policy = %self.executor.policy(),
            "Poll worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scans = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Poll worker received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let worker = self.clone();
                    scans.spawn(async move {
                        if let Err(e) = worker.scan_once().await {
                            error!(error = %e, "Scan failed");
                        }
                    });
                }
                Some(joined) = scans.join_next(), if !scans.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = ?e, "Scan task panicked");
                    }
                }
            }
        }

        // No new scans; let in-flight ones finish.
        while let Some(joined) = scans.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Scan task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Poll worker stopped");
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    jobs: Arc<dyn JobRepository>,
    config: WorkerConfig,
    policy: RetryPolicy,
    handlers: HandlerRegistry,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            config: WorkerConfig::default(),
            policy: RetryPolicy::poll_default(),
            handlers: HashMap::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.insert(handler.job_type(), Arc::new(handler));
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> JobWorker {
        JobWorker::new(self.jobs, self.config, self.policy, self.handlers)
    }
}
