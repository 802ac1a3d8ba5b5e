/*!
 * Broker abstraction used by the outbox dispatcher and the two consumers.
 *
 * Topics are the routing keys of the domain: `inventory.<eventType>` for
 * outbox events and `wms.forceSync` for reconciliation commands. Messages a
 * consumer cannot ever process are republished under `dead_letter.<topic>`.
 */

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Prefix under which poisoned messages are parked for operators.
pub const DEAD_LETTER_PREFIX: &str = "dead_letter.";

/// Dead-letter topic for a given source topic.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{DEAD_LETTER_PREFIX}{topic}")
}

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
}

/// Message envelope for queue items. `id` is the outbox event id for domain
/// events (the sync request id for commands), which is what makes downstream
/// consumers idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
}

impl Message {
    pub fn new(id: i64, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
        }
    }
}

/// Message queue trait for different implementations
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;
    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError>;
    async fn ack(&self, message_id: i64) -> Result<(), MessageQueueError>;
    /// Returns the message to the back of its queue for another attempt.
    async fn nack(&self, message_id: i64) -> Result<(), MessageQueueError>;
}

/// Builds the queue implementation selected by the broker URL: `redis://`
/// connects to Redis, anything else (notably `memory://`) stays in-process.
/// Connecting to Redis also requeues any messages a crashed consumer left in
/// a processing list, before the queue is handed to any worker.
pub async fn connect(broker_url: &str) -> Result<Arc<dyn MessageQueue>, MessageQueueError> {
    if broker_url.starts_with("redis://") || broker_url.starts_with("rediss://") {
        let client = redis::Client::open(broker_url)
            .map_err(|e| MessageQueueError::ConnectionError(e.to_string()))?;
        info!("Using Redis message queue at {}", broker_url);
        let queue = RedisMessageQueue::new(
            Arc::new(client),
            RedisMessageQueue::DEFAULT_NAMESPACE,
            Duration::from_secs(1),
        )
        .await?;
        Ok(Arc::new(queue))
    } else {
        info!("Using in-memory message queue");
        Ok(Arc::new(InMemoryMessageQueue::new()))
    }
}

#[derive(Clone, Debug)]
struct InFlightRecord {
    topic: String,
    message: Message,
}

/// In-memory message queue implementation, used for local runs and tests.
/// Tracks in-flight messages so `nack` actually requeues.
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    inflight: Mutex<HashMap<i64, InFlightRecord>>,
    max_size: usize,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            max_size: 10_000,
        }
    }

    /// Number of messages currently waiting on a topic.
    pub fn depth(&self, topic: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(topic)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(message.topic.clone()).or_default();

        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }

        queue.push_back(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let popped = {
            let mut queues = self.queues.lock().unwrap();
            queues.get_mut(topic).and_then(|q| q.pop_front())
        };

        if let Some(message) = popped {
            self.inflight.lock().unwrap().insert(
                message.id,
                InFlightRecord {
                    topic: topic.to_string(),
                    message: message.clone(),
                },
            );
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    async fn ack(&self, message_id: i64) -> Result<(), MessageQueueError> {
        self.inflight.lock().unwrap().remove(&message_id);
        Ok(())
    }

    async fn nack(&self, message_id: i64) -> Result<(), MessageQueueError> {
        let record = self.inflight.lock().unwrap().remove(&message_id);
        if let Some(mut record) = record {
            record.message.retry_count += 1;
            let mut queues = self.queues.lock().unwrap();
            queues
                .entry(record.topic)
                .or_default()
                .push_back(record.message);
        }
        Ok(())
    }
}

/// Redis-backed message queue for cross-instance durability.
///
/// Keys under the namespace: `queue:<topic>` holds waiting messages,
/// `processing:<topic>` holds messages a consumer has pulled but not yet
/// settled, and `topics` records every topic ever published, which lets
/// crash recovery find orphaned processing lists it has never seen.
pub struct RedisMessageQueue {
    client: Arc<redis::Client>,
    namespace: String,
    block_timeout: Duration,
    inflight: Mutex<HashMap<i64, RedisInFlight>>,
}

/// A message pulled via `subscribe` and not yet settled. The raw string is
/// kept for the LREM that removes it from the processing list; the decoded
/// message is kept so a nack can requeue it with its retry count bumped.
#[derive(Debug)]
struct RedisInFlight {
    topic: String,
    raw: String,
    message: Message,
}

fn redis_error(err: redis::RedisError) -> MessageQueueError {
    MessageQueueError::ConnectionError(err.to_string())
}

impl RedisMessageQueue {
    pub const DEFAULT_NAMESPACE: &'static str = "inventory:mq";

    /// Connects and immediately drains every processing list back onto its
    /// queue, so messages stranded by a crashed consumer are redelivered
    /// instead of sitting invisible forever. Runs before any worker polls.
    pub async fn new(
        client: Arc<redis::Client>,
        namespace: impl Into<String>,
        block_timeout: Duration,
    ) -> Result<Self, MessageQueueError> {
        let namespace = namespace.into();
        let namespace = if namespace.trim().is_empty() {
            Self::DEFAULT_NAMESPACE.to_string()
        } else {
            namespace
        };

        let queue = Self {
            client,
            namespace,
            block_timeout,
            inflight: Mutex::new(HashMap::new()),
        };

        let recovered = queue.recover_stalled_messages().await?;
        if recovered > 0 {
            warn!(
                recovered,
                "requeued messages stranded by a previous consumer"
            );
        }

        Ok(queue)
    }

    async fn conn(&self) -> Result<redis::aio::Connection, MessageQueueError> {
        self.client
            .get_async_connection()
            .await
            .map_err(redis_error)
    }

    fn queue_key(&self, topic: &str) -> String {
        format!("{}:queue:{}", self.namespace, topic)
    }

    fn processing_key(&self, topic: &str) -> String {
        format!("{}:processing:{}", self.namespace, topic)
    }

    fn topics_key(&self) -> String {
        format!("{}:topics", self.namespace)
    }

    fn block_timeout_secs(&self) -> usize {
        self.block_timeout.as_secs().max(1) as usize
    }

    /// Moves messages stranded in processing lists back onto their queues
    /// and returns how many were recovered.
    pub async fn recover_stalled_messages(&self) -> Result<usize, MessageQueueError> {
        let mut conn = self.conn().await?;

        let topics: Vec<String> = conn
            .smembers(self.topics_key())
            .await
            .map_err(redis_error)?;

        let mut recovered = 0usize;
        for topic in topics {
            let processing_key = self.processing_key(&topic);
            let queue_key = self.queue_key(&topic);

            loop {
                let moved: Option<String> = conn
                    .rpoplpush(&processing_key, &queue_key)
                    .await
                    .map_err(redis_error)?;
                if moved.is_none() {
                    break;
                }
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| MessageQueueError::SerializationError(e.to_string()))?;

        // One atomic step: enqueue the message and remember its topic so
        // recovery can find the processing list later.
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .lpush(self.queue_key(&message.topic), &payload)
            .ignore()
            .sadd(self.topics_key(), &message.topic)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut conn = self.conn().await?;

        // The message moves into the processing list in the same step it is
        // handed out; it stays there until ack or nack settles it.
        let raw: Option<String> = conn
            .brpoplpush(
                self.queue_key(topic),
                self.processing_key(topic),
                self.block_timeout_secs() as f64,
            )
            .await
            .map_err(redis_error)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let message: Message = serde_json::from_str(&raw)
            .map_err(|e| MessageQueueError::SerializationError(e.to_string()))?;

        self.inflight.lock().unwrap().insert(
            message.id,
            RedisInFlight {
                topic: topic.to_string(),
                raw,
                message: message.clone(),
            },
        );

        Ok(Some(message))
    }

    async fn ack(&self, message_id: i64) -> Result<(), MessageQueueError> {
        let settled = self.inflight.lock().unwrap().remove(&message_id);
        let Some(settled) = settled else {
            return Ok(());
        };

        let mut conn = self.conn().await?;
        let _: i64 = conn
            .lrem(self.processing_key(&settled.topic), 1, &settled.raw)
            .await
            .map_err(redis_error)?;

        Ok(())
    }

    async fn nack(&self, message_id: i64) -> Result<(), MessageQueueError> {
        let settled = self.inflight.lock().unwrap().remove(&message_id);
        let Some(settled) = settled else {
            return Ok(());
        };

        // Requeue with the attempt recorded, as the in-memory queue does,
        // so consumers can see how often a message has bounced.
        let mut retried = settled.message;
        retried.retry_count += 1;
        let payload = serde_json::to_string(&retried)
            .map_err(|e| MessageQueueError::SerializationError(e.to_string()))?;

        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.processing_key(&settled.topic), 1, &settled.raw)
            .ignore()
            .rpush(self.queue_key(&settled.topic), payload)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_queue_delivers_in_order() {
        let queue = InMemoryMessageQueue::new();
        queue
            .publish(Message::new(1, "inventory.InventoryAllocated", serde_json::json!({"n": 1})))
            .await
            .unwrap();
        queue
            .publish(Message::new(2, "inventory.InventoryAllocated", serde_json::json!({"n": 2})))
            .await
            .unwrap();

        let first = queue
            .subscribe("inventory.InventoryAllocated")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, 1);

        let second = queue
            .subscribe("inventory.InventoryAllocated")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, 2);

        assert!(queue
            .subscribe("inventory.InventoryAllocated")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn nack_requeues_with_bumped_retry_count() {
        let queue = InMemoryMessageQueue::new();
        queue
            .publish(Message::new(7, "wms.forceSync", serde_json::json!({})))
            .await
            .unwrap();

        let msg = queue.subscribe("wms.forceSync").await.unwrap().unwrap();
        assert_eq!(msg.retry_count, 0);
        queue.nack(msg.id).await.unwrap();

        let again = queue.subscribe("wms.forceSync").await.unwrap().unwrap();
        assert_eq!(again.id, 7);
        assert_eq!(again.retry_count, 1);

        queue.ack(again.id).await.unwrap();
        assert_eq!(queue.depth("wms.forceSync"), 0);
    }

    #[test]
    fn dead_letter_topic_is_prefixed() {
        assert_eq!(
            dead_letter_topic("inventory.InventoryAllocated"),
            "dead_letter.inventory.InventoryAllocated"
        );
    }
}
