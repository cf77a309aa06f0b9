//! Redis Streams broker.
//!
//! - **Stream key**: `<prefix><topic>` (e.g. `hap:payments.recorded`)
//! - **Writes**: `XADD <key> * key <k> payload <bytes>`
//! - **Consumer groups**: `XGROUP CREATE ... MKSTREAM` on reader open; the
//!   group starts at `$`, so a brand-new group only sees messages written
//!   after it was created
//! - **Reads**: the consumer's own pending entries first (delivered before a
//!   crash, never acknowledged), then new entries via `XREADGROUP ... >` with
//!   `BLOCK`
//! - **Commit**: `XACK`
//!
//! Connection-level failures map to transient transport errors; a key that
//! exists with a non-stream type is a configuration error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tracing::{debug, instrument, warn};

use hap_events::{Broker, InboundMessage, OutboundMessage, TopicReader, TopicWriter, TransportError};

const DEFAULT_BLOCK: Duration = Duration::from_secs(1);
const DEFAULT_BATCH: usize = 16;

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    prefix: String,
    block: Duration,
    batch: usize,
}

impl RedisStreamsBroker {
    /// Create a broker for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is made until the first writer or reader is opened.
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::misconfigured("*", format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.into(),
            block: DEFAULT_BLOCK,
            batch: DEFAULT_BATCH,
        })
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, TransportError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("*", e))
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, TransportError> {
        let conn = self.connect().await?;
        Ok(Arc::new(RedisStreamWriter {
            topic: topic.to_string(),
            key: self.stream_key(topic),
            conn,
            closed: AtomicBool::new(false),
        }))
    }

    async fn reader(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn TopicReader>, TransportError> {
        // Blocking reads get their own connection so they never stall writers.
        let conn = self.connect().await?;
        let mut reader = RedisStreamReader {
            topic: topic.to_string(),
            key: self.stream_key(topic),
            group: group.to_string(),
            consumer: consumer.to_string(),
            conn,
            block_ms: self.block.as_millis() as u64,
            batch: self.batch,
            buffered: VecDeque::new(),
            pending_drained: false,
            closed: false,
        };
        reader.ensure_group().await?;
        Ok(Box::new(reader))
    }
}

struct RedisStreamWriter {
    topic: String,
    key: String,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

#[async_trait]
impl TopicWriter for RedisStreamWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    #[instrument(skip(self, message), fields(stream_key = %self.key, key = %message.key), err)]
    async fn write(&self, message: OutboundMessage) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.topic.clone()));
        }

        let mut conn = self.conn.clone();
        redis::cmd("XADD")
            .arg(&self.key)
            .arg("*")
            .arg(KEY_FIELD)
            .arg(message.key.as_bytes())
            .arg(PAYLOAD_FIELD)
            .arg(&message.payload[..])
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| map_redis_error(&self.topic, e))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct RedisStreamReader {
    topic: String,
    key: String,
    group: String,
    consumer: String,
    conn: MultiplexedConnection,
    block_ms: u64,
    batch: usize,
    buffered: VecDeque<InboundMessage>,
    pending_drained: bool,
    closed: bool,
}

impl RedisStreamReader {
    /// Create the consumer group (and the stream) if missing.
    async fn ensure_group(&mut self) -> Result<(), TransportError> {
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<_, String>(&mut self.conn)
            .await;

        match created {
            Ok(_) => {
                debug!(stream_key = %self.key, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(&self.topic, e)),
        }
    }

    async fn fill(&mut self) -> Result<(), TransportError> {
        // "0" replays this consumer's unacknowledged entries; ">" asks for new ones.
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch);
        if self.pending_drained {
            cmd.arg("BLOCK").arg(self.block_ms);
        }
        cmd.arg("STREAMS")
            .arg(&self.key)
            .arg(if self.pending_drained { ">" } else { "0" });

        let reply = match cmd.query_async::<_, Option<StreamReadReply>>(&mut self.conn).await {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => {
                // Group (or stream) deleted under us: recreate and retry later.
                warn!(stream_key = %self.key, group = %self.group, "consumer group missing; recreating");
                self.ensure_group().await?;
                return Err(TransportError::Unavailable(format!(
                    "consumer group {} was recreated",
                    self.group
                )));
            }
            Err(e) => return Err(map_redis_error(&self.topic, e)),
        };

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        if entries.is_empty() && !self.pending_drained {
            self.pending_drained = true;
        }

        let now = Utc::now();
        for entry in entries {
            let key = entry.get::<String>(KEY_FIELD);
            let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
            self.buffered.push_back(InboundMessage {
                topic: self.topic.clone(),
                position: entry.id,
                key,
                payload,
                received_at: now,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TopicReader for RedisStreamReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed(self.topic.clone()));
        }
        if self.buffered.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffered.pop_front())
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), TransportError> {
        redis::cmd("XACK")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&message.position)
            .query_async::<_, i64>(&mut self.conn)
            .await
            .map(|_| ())
            .map_err(|e| map_redis_error(&self.topic, e))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.buffered.clear();
        Ok(())
    }
}

fn map_redis_error(topic: &str, err: redis::RedisError) -> TransportError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        return TransportError::Unavailable(err.to_string());
    }
    if err.code() == Some("WRONGTYPE") {
        return TransportError::misconfigured(topic, err.to_string());
    }
    TransportError::Command(err.to_string())
}
