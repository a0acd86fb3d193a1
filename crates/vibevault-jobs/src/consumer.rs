//! Push runner: consumes job signals from a message queue.
//!
//! A delivery only names a job. The consumer claims it conditionally; if the
//! job is no longer claimable the delivery is a stale duplicate and is acked
//! and dropped. Retry timing comes from the retry policy and is applied to
//! both the job row and the queue redelivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use vibevault_core::{defaults, JobRepository, Result};

use crate::executor::{JobExecutor, Outcome};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::queue::{Delivery, MessageQueue};
use crate::retry::RetryPolicy;
use crate::worker::{generate_worker_id, WorkerEvent, WorkerHandle};

/// Delay before redelivering a message whose claim hit a store error.
const CLAIM_ERROR_REDELIVERY: Duration = Duration::from_secs(5);

/// Configuration for the push runner.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue_name: String,
    /// Maximum deliveries processed at once.
    pub max_concurrent: usize,
    /// How long one receive call blocks; bounds shutdown latency.
    pub receive_timeout: Duration,
    pub job_timeout: Duration,
    pub lease: chrono::Duration,
    pub worker_id: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_name: defaults::QUEUE_NAME.to_string(),
            max_concurrent: defaults::JOB_MAX_CONCURRENT,
            receive_timeout: Duration::from_secs(defaults::QUEUE_RECEIVE_TIMEOUT_SECS),
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            lease: chrono::Duration::seconds(defaults::JOB_LEASE_SECS),
            worker_id: generate_worker_id("push"),
        }
    }
}

impl ConsumerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `QUEUE_NAME` | `metadata` |
    /// | `JOB_MAX_CONCURRENT` | `4` |
    /// | `JOB_TIMEOUT_SECS` | `60` |
    /// | `JOB_LEASE_SECS` | `120` |
    /// | `WORKER_ID` | random |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_name: std::env::var("QUEUE_NAME").unwrap_or(defaults.queue_name),
            max_concurrent: std::env::var("JOB_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.max_concurrent)
                .max(1),
            receive_timeout: defaults.receive_timeout,
            job_timeout: std::env::var("JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            lease: std::env::var("JOB_LEASE_SECS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.lease),
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }
}

/// Queue consumer driving job execution.
pub struct QueueConsumer {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn MessageQueue>,
    config: ConsumerConfig,
    executor: JobExecutor,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl QueueConsumer {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn MessageQueue>,
        config: ConsumerConfig,
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
            queue,
            config,
            executor,
            event_tx,
        }
    }

    /// Get a receiver for consumer events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start consuming and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let consumer = Arc::new(self);
        let task = tokio::spawn(async move {
            consumer.run(shutdown_rx).await;
        });

        WorkerHandle::new(shutdown_tx, event_rx, task)
    }

    /// Handle one delivery end to end: claim, execute, ack or nack.
    pub async fn process(&self, delivery: Delivery) -> Result<Option<Outcome>> {
        let job_id = delivery.message.job_id;

        let job = match self
            .jobs
            .claim(job_id, &self.config.worker_id, self.config.lease)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(
                    subsystem = "jobs",
                    component = "push",
                    %job_id,
                    "Job not claimable, dropping delivery"
                );
                self.queue.ack(&delivery).await?;
                return Ok(None);
            }
            Err(e) => {
                error!(error = %e, %job_id, "Failed to claim job, redelivering later");
                self.queue.nack(&delivery, CLAIM_ERROR_REDELIVERY).await?;
                return Err(e);
            }
        };

        let outcome = self.executor.run(job).await;
        match &outcome {
            Outcome::Retrying { delay } => self.queue.nack(&delivery, *delay).await?,
            _ => self.queue.ack(&delivery).await?,
        }
        Ok(Some(outcome))
    }

    #[instrument(skip(self, shutdown_rx), fields(worker_id = %self.config.worker_id))]
    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            queue = %self.config.queue_name,
            max_concurrent = self.config.max_concurrent,
            policy = %self.executor.policy(),
            "Queue consumer started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            // Reap finished deliveries.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = ?e, "Delivery task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Queue consumer received shutdown signal");
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Queue consumer received shutdown signal");
                    break;
                }
                received = self
                    .queue
                    .receive(&self.config.queue_name, self.config.receive_timeout) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let consumer = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = consumer.process(delivery).await {
                            warn!(error = %e, "Delivery not settled");
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Queue receive failed");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.config.receive_timeout) => {}
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Delivery task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Queue consumer stopped");
    }
}

/// Builder for a queue consumer with handlers.
pub struct ConsumerBuilder {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn MessageQueue>,
    config: ConsumerConfig,
    policy: RetryPolicy,
    handlers: HandlerRegistry,
}

impl ConsumerBuilder {
    pub fn new(jobs: Arc<dyn JobRepository>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            jobs,
            queue,
            config: ConsumerConfig::default(),
            policy: RetryPolicy::push_default(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.insert(handler.job_type(), Arc::new(handler));
        self
    }

    pub fn build(self) -> QueueConsumer {
        QueueConsumer::new(
            self.jobs,
            self.queue,
            self.config,
            self.policy,
            self.handlers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_default() {
        let config = ConsumerConfig::default();
        assert_eq!(config.queue_name, "metadata");
        assert_eq!(config.max_concurrent, defaults::JOB_MAX_CONCURRENT);
        assert!(config.worker_id.starts_with("push-"));
    }

    #[test]
    fn test_consumer_config_builder() {
        let config = ConsumerConfig::default()
            .with_queue_name("other")
            .with_max_concurrent(1)
            .with_receive_timeout(Duration::from_millis(50));
        assert_eq!(config.queue_name, "other");
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.receive_timeout, Duration::from_millis(50));
    }
}
