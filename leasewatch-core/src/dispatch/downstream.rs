use async_trait::async_trait;
use leasewatch_model::DispatchMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{PollError, Result};

/// Sink for dispatched records. Delivery is at-least-once: a record whose
/// completion write is lost is published again by a later claim.
#[async_trait]
pub trait DownstreamQueue: Send + Sync {
    async fn publish(&self, message: &DispatchMessage) -> Result<()>;
}

/// Wire envelope: the message plus its deduplication id.
#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    message: &'a DispatchMessage,
    dedupe_id: String,
}

impl<'a> Envelope<'a> {
    fn new(message: &'a DispatchMessage) -> Self {
        Self {
            message,
            dedupe_id: message.dedupe_id(),
        }
    }
}

/// Writes each message to the log. For local runs without a queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDownstreamQueue;

#[async_trait]
impl DownstreamQueue for LogDownstreamQueue {
    async fn publish(&self, message: &DispatchMessage) -> Result<()> {
        let payload = serde_json::to_string(&Envelope::new(message))?;
        info!(
            target: "leasewatch::dispatch",
            tenant = %message.tenant_id,
            record = %message.record_id,
            kind = %message.kind,
            classification = %message.classification,
            %payload,
            "dispatched"
        );
        Ok(())
    }
}

/// In-process channel sink.
#[derive(Clone, Debug)]
pub struct ChannelDownstreamQueue {
    tx: mpsc::UnboundedSender<DispatchMessage>,
}

impl ChannelDownstreamQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DownstreamQueue for ChannelDownstreamQueue {
    async fn publish(&self, message: &DispatchMessage) -> Result<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| PollError::Downstream("downstream receiver dropped".into()))
    }
}

/// Redis list sink: `LPUSH <queue_key> <json envelope>`.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisDownstreamQueue {
    conn: redis::aio::ConnectionManager,
    queue_key: String,
}

#[cfg(feature = "redis")]
impl std::fmt::Debug for RedisDownstreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDownstreamQueue")
            .field("connection", &"ConnectionManager")
            .field("queue_key", &self.queue_key)
            .finish()
    }
}

#[cfg(feature = "redis")]
impl RedisDownstreamQueue {
    pub async fn connect(redis_url: &str, queue_key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| PollError::Config(format!("invalid Redis URL: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        let queue_key = queue_key.into();
        info!(
            target: "leasewatch::dispatch",
            queue_key = %queue_key,
            "connected to Redis downstream queue"
        );
        Ok(Self { conn, queue_key })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl DownstreamQueue for RedisDownstreamQueue {
    async fn publish(&self, message: &DispatchMessage) -> Result<()> {
        use redis::AsyncCommands;

        let payload = serde_json::to_string(&Envelope::new(message))?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&self.queue_key, payload).await?;
        Ok(())
    }
}
