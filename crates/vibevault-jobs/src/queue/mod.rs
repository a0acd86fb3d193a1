//! Message queue abstraction for the push runner.
//!
//! Queue messages are only a wake-up signal: the job row stays the source of
//! truth, and redelivery timing is mechanical. Delivery is at-least-once.

mod memory;
mod redis;

pub use self::memory::InMemoryQueue;
pub use self::redis::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vibevault_core::{Job, JobKind, Result};

/// Body of a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub link_id: Uuid,
    pub url: String,
}

impl QueueMessage {
    pub fn for_job(job: &Job) -> Self {
        let JobKind::FetchMetadata(payload) = &job.kind;
        Self {
            job_id: job.id,
            link_id: job.link_id,
            url: payload.url.clone(),
        }
    }
}

/// A received message awaiting ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub message: QueueMessage,
    /// Backend-specific handle identifying this delivery.
    pub(crate) receipt: String,
}

/// Queue transport.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish a message to the named queue.
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()>;

    /// Wait up to `timeout` for the next message.
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>>;

    /// Message handled; drop it.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Redeliver the message after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()>;
}

/// Serialized form carried by the transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    message: QueueMessage,
}

impl Envelope {
    fn new(message: QueueMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
        }
    }
}
