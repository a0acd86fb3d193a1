//! In-process queue on tokio channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use vibevault_core::{Error, Result};

use super::{Delivery, Envelope, MessageQueue, QueueMessage};

struct QueueChannels {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl QueueChannels {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

/// Queue living in the current process.
///
/// Nacked messages are re-sent by a timer task after their delay.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    queues: Arc<RwLock<HashMap<String, QueueChannels>>>,
    in_flight: Arc<Mutex<HashMap<String, Envelope>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, queue: &str) -> mpsc::UnboundedSender<Envelope> {
        if let Some(channels) = self.queues.read().await.get(queue) {
            return channels.sender.clone();
        }
        let mut queues = self.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(QueueChannels::new)
            .sender
            .clone()
    }

    async fn receiver(&self, queue: &str) -> Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>> {
        if let Some(channels) = self.queues.read().await.get(queue) {
            return channels.receiver.clone();
        }
        let mut queues = self.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(QueueChannels::new)
            .receiver
            .clone()
    }

    /// Deliveries received but neither acked nor nacked yet.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn send(&self, queue: &str, envelope: Envelope) -> Result<()> {
        self.sender(queue)
            .await
            .send(envelope)
            .map_err(|_| Error::Queue(format!("queue {queue} is closed")))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        self.send(queue, Envelope::new(message.clone())).await
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let receiver = self.receiver(queue).await;
        let mut rx = receiver.lock().await;

        let envelope = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) | Err(_) => return Ok(None),
        };

        let receipt = envelope.id.to_string();
        let delivery = Delivery {
            queue: queue.to_string(),
            message: envelope.message.clone(),
            receipt: receipt.clone(),
        };
        self.in_flight.lock().await.insert(receipt, envelope);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.in_flight.lock().await.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let Some(envelope) = self.in_flight.lock().await.remove(&delivery.receipt) else {
            return Ok(());
        };

        debug!(
            subsystem = "queue",
            component = "memory",
            op = "nack",
            job_id = %delivery.message.job_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduling redelivery"
        );

        let sender = self.sender(&delivery.queue).await;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(envelope);
        });
        Ok(())
    }
}
