//! Runs one claimed job and settles its outcome.
//!
//! Shared by the poll and push runners so both apply the same timeout,
//! lease-guarded state transitions, and retry policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use vibevault_core::{Job, JobRepository};

use crate::handler::{HandlerRegistry, JobContext, JobResult};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::worker::WorkerEvent;

/// How a job attempt ended, as seen by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Re-queued; claimable again after `delay`.
    Retrying { delay: Duration },
    Failed { error: String },
    /// The store refused the write: the lease was lost to the reconciler.
    LeaseLost,
    /// The store could not be written; the reconciler will pick it up.
    Unsettled,
}

/// Executes claimed jobs on behalf of one runner instance.
#[derive(Clone)]
pub struct JobExecutor {
    jobs: Arc<dyn JobRepository>,
    handlers: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    worker_id: String,
    job_timeout: Duration,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        handlers: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        worker_id: impl Into<String>,
        job_timeout: Duration,
        event_tx: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            jobs,
            handlers,
            policy,
            worker_id: worker_id.into(),
            job_timeout,
            event_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run a job this runner has just claimed and record the result.
    pub async fn run(&self, job: Job) -> Outcome {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type();
        let attempt = job.attempts;

        info!(
            subsystem = "jobs",
            component = "executor",
            op = "run",
            %job_id,
            link_id = %job.link_id,
            %job_type,
            attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            job_type,
            attempt,
        });

        let handler = self.handlers.get(&job_type).cloned();
        let result = match &handler {
            Some(handler) => {
                let ctx = JobContext::new(job.clone());
                match tokio::time::timeout(self.job_timeout, handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let error = format!("job exceeded timeout of {:?}", self.job_timeout);
                        warn!(%job_id, %job_type, %error, "Job timed out");
                        JobResult::Retry(error)
                    }
                }
            }
            None => {
                warn!(%job_type, "No handler registered for job type");
                JobResult::Failed(format!("no handler for job type: {job_type}"))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            JobResult::Success(_) => match self.jobs.complete(job_id, &self.worker_id).await {
                Ok(true) => {
                    info!(%job_id, %job_type, attempt, duration_ms, "Job completed successfully");
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, job_type });
                    Outcome::Completed
                }
                Ok(false) => self.lease_lost(&job),
                Err(e) => {
                    error!(error = %e, %job_id, "Failed to mark job as completed");
                    Outcome::Unsettled
                }
            },
            JobResult::Failed(error) => self.give_up(&job, handler, error, duration_ms).await,
            JobResult::Retry(error) => match self.policy.decide(attempt) {
                RetryDecision::GiveUp => self.give_up(&job, handler, error, duration_ms).await,
                RetryDecision::Retry { delay } => {
                    let retry_at = chrono::Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    match self
                        .jobs
                        .fail(job_id, &self.worker_id, &error, Some(retry_at))
                        .await
                    {
                        Ok(true) => {
                            warn!(
                                %job_id,
                                %job_type,
                                attempt,
                                %error,
                                delay_ms = delay.as_millis() as u64,
                                duration_ms,
                                "Job failed, will retry"
                            );
                            let _ = self.event_tx.send(WorkerEvent::JobRetrying {
                                job_id,
                                job_type,
                                attempt,
                                delay,
                                error,
                            });
                            Outcome::Retrying { delay }
                        }
                        Ok(false) => self.lease_lost(&job),
                        Err(e) => {
                            error!(error = %e, %job_id, "Failed to re-queue job");
                            Outcome::Unsettled
                        }
                    }
                }
            },
        }
    }

    async fn give_up(
        &self,
        job: &Job,
        handler: Option<Arc<dyn crate::handler::JobHandler>>,
        error: String,
        duration_ms: u64,
    ) -> Outcome {
        let job_id = job.id;
        let job_type = job.job_type();

        match self.jobs.fail(job_id, &self.worker_id, &error, None).await {
            Ok(true) => {
                warn!(
                    %job_id,
                    %job_type,
                    attempt = job.attempts,
                    %error,
                    duration_ms,
                    "Job failed"
                );
                if let Some(handler) = handler {
                    handler.on_failed(job, &error).await;
                }
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    job_type,
                    error: error.clone(),
                });
                Outcome::Failed { error }
            }
            Ok(false) => self.lease_lost(job),
            Err(e) => {
                error!(error = %e, %job_id, "Failed to mark job as failed");
                Outcome::Unsettled
            }
        }
    }

    fn lease_lost(&self, job: &Job) -> Outcome {
        debug!(
            job_id = %job.id,
            worker_id = %self.worker_id,
            "Lease no longer held, outcome discarded"
        );
        Outcome::LeaseLost
    }
}
