//! Redis-backed reliable queue.
//!
//! Layout per queue name `q` (under the key prefix):
//! - `q` list: ready messages (`LPUSH` in, `BRPOPLPUSH` out)
//! - `q:processing` list: received, not yet acked
//! - `q:delayed` sorted set: nacked messages scored by due time (ms)

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use vibevault_core::{Error, Result};

use super::{Delivery, Envelope, MessageQueue, QueueMessage};

const KEY_PREFIX: &str = "vv:queue:";

/// Max delayed messages promoted per receive.
const PROMOTE_BATCH: isize = 100;

fn queue_err(e: redis::RedisError) -> Error {
    Error::Queue(e.to_string())
}

/// `redis_url` with any password replaced, for logging.
fn mask_password(redis_url: &str) -> String {
    match url::Url::parse(redis_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "(unparseable)".to_string(),
    }
}

/// Reliable list queue on Redis.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    /// Separate connection for blocking pops.
    blocking: ConnectionManager,
}

impl RedisQueue {
    /// Connect to `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(queue_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(queue_err)?;
        let blocking = ConnectionManager::new(client).await.map_err(queue_err)?;

        info!(
            subsystem = "queue",
            component = "redis",
            op = "connect",
            redis_url = %mask_password(redis_url),
            "Connected to Redis queue"
        );
        Ok(Self { conn, blocking })
    }

    fn ready_key(queue: &str) -> String {
        format!("{KEY_PREFIX}{queue}")
    }

    fn processing_key(queue: &str) -> String {
        format!("{KEY_PREFIX}{queue}:processing")
    }

    fn delayed_key(queue: &str) -> String {
        format!("{KEY_PREFIX}{queue}:delayed")
    }

    /// Move every unacked message back to the ready list.
    ///
    /// Run at consumer start-up to recover deliveries of a crashed consumer.
    /// Duplicates are harmless: a delivery whose job is no longer queued is
    /// dropped by the consumer.
    pub async fn recover_processing(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut moved = 0usize;
        loop {
            let item: Option<String> = conn
                .rpoplpush(Self::processing_key(queue), Self::ready_key(queue))
                .await
                .map_err(queue_err)?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!(
                subsystem = "queue",
                component = "redis",
                op = "recover",
                queue,
                job_count = moved,
                "Recovered unacked deliveries"
            );
        }
        Ok(moved)
    }

    /// Move due delayed messages to the ready list.
    async fn promote_due(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(Self::delayed_key(queue), "-inf", now_ms, 0, PROMOTE_BATCH)
            .await
            .map_err(queue_err)?;

        for payload in due {
            // Only the consumer whose ZREM succeeds re-pushes the message.
            let removed: i64 = conn
                .zrem(Self::delayed_key(queue), &payload)
                .await
                .map_err(queue_err)?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(Self::ready_key(queue), &payload)
                    .await
                    .map_err(queue_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        let payload = serde_json::to_string(&Envelope::new(message.clone()))?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(Self::ready_key(queue), payload)
            .await
            .map_err(queue_err)
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        self.promote_due(queue).await?;

        let mut conn = self.blocking.clone();
        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(Self::ready_key(queue))
            .arg(Self::processing_key(queue))
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => Ok(Some(Delivery {
                queue: queue.to_string(),
                message: envelope.message,
                receipt: payload,
            })),
            Err(e) => {
                warn!(
                    subsystem = "queue",
                    component = "redis",
                    error = %e,
                    "Dropping undecodable queue message"
                );
                let mut conn = self.conn.clone();
                conn.lrem::<_, _, ()>(Self::processing_key(queue), 1, &payload)
                    .await
                    .map_err(queue_err)?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(Self::processing_key(&delivery.queue), 1, &delivery.receipt)
            .await
            .map_err(queue_err)
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .lrem(Self::processing_key(&delivery.queue), 1, &delivery.receipt)
            .ignore()
            .zadd(Self::delayed_key(&delivery.queue), &delivery.receipt, due_ms)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(queue_err)?;

        debug!(
            subsystem = "queue",
            component = "redis",
            op = "nack",
            job_id = %delivery.message.job_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduled redelivery"
        );
        Ok(())
    }
}
