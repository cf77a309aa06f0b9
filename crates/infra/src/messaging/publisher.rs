//! Publisher pool: one long-lived writer per configured topic.
//!
//! The pool is built once at startup from a fixed [`TopicSet`] and never
//! changes afterwards, so lookups need no locking and every writer is shared
//! by all callers. Publishing is **at-most-once** and best-effort:
//!
//! - each call is bounded by a timeout (2s unless configured otherwise)
//! - a failed or timed-out publish is logged and counted, then returned to the
//!   caller, which must not treat it as a failure of the business operation
//!   that triggered it
//! - nothing is retried or buffered; a lost event stays lost until the state it
//!   announced is re-derived
//!
//! Publishing to a topic outside the configured set fails immediately with
//! [`PublishError::TopicNotInitialized`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use hap_core::ErrorKind;
use hap_events::{Broker, CodecError, Event, OutboundMessage, TopicSet, TopicWriter, TransportError, encode};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("topic not initialized: {topic}")]
    TopicNotInitialized { topic: String },

    #[error("publish to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("publish to {topic} failed: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Encode(#[from] CodecError),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Messaging
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            PublishError::TopicNotInitialized { topic }
            | PublishError::Timeout { topic, .. }
            | PublishError::Transport { topic, .. } => Some(topic),
            PublishError::Encode(_) => None,
        }
    }
}

/// Where a published message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub position: String,
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub unknown_topic: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    unknown_topic: AtomicU64,
}

pub struct PublisherPool {
    writers: HashMap<String, Arc<dyn TopicWriter>>,
    default_timeout: Duration,
    counters: Counters,
}

impl core::fmt::Debug for PublisherPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut topics: Vec<&str> = self.writers.keys().map(String::as_str).collect();
        topics.sort_unstable();
        f.debug_struct("PublisherPool")
            .field("topics", &topics)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl PublisherPool {
    /// Open one writer per topic. Fails if any topic cannot be opened.
    pub async fn connect(
        broker: &dyn Broker,
        topics: &TopicSet,
        default_timeout: Duration,
    ) -> Result<Self, PublishError> {
        let mut writers = HashMap::with_capacity(topics.len());
        for topic in topics.iter() {
            let writer = broker.writer(topic).await.map_err(|source| PublishError::Transport {
                topic: topic.to_string(),
                source,
            })?;
            writers.insert(topic.to_string(), writer);
        }

        info!(topics = %topics, timeout_ms = default_timeout.as_millis() as u64, "publisher pool ready");

        Ok(Self {
            writers,
            default_timeout,
            counters: Counters::default(),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Publish raw bytes on `topic`, bounded by `timeout`.
    #[instrument(skip(self, payload), fields(topic = %topic, key = %key), err)]
    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<PublishReceipt, PublishError> {
        let Some(writer) = self.writers.get(topic) else {
            self.counters.unknown_topic.fetch_add(1, Ordering::Relaxed);
            warn!(topic, key, "publish to unconfigured topic");
            return Err(PublishError::TopicNotInitialized {
                topic: topic.to_string(),
            });
        };

        match tokio::time::timeout(timeout, writer.write(OutboundMessage::new(key, payload))).await {
            Ok(Ok(position)) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(topic, key, position = %position, "published");
                Ok(PublishReceipt {
                    topic: topic.to_string(),
                    position,
                })
            }
            Ok(Err(source)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(topic, key, error = %source, "publish failed; event dropped");
                Err(PublishError::Transport {
                    topic: topic.to_string(),
                    source,
                })
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(topic, key, timeout_ms = timeout.as_millis() as u64, "publish timed out; event dropped");
                Err(PublishError::Timeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Wrap `data` in an envelope and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        key: &str,
        event_type: &str,
        data: &T,
        timeout: Duration,
    ) -> Result<PublishReceipt, PublishError> {
        let payload = encode(event_type, data)?;
        self.publish(topic, key, payload, timeout).await
    }

    /// Publish an [`Event`] on its own topic with the default timeout.
    pub async fn emit<E: Event>(&self, event: &E) -> Result<PublishReceipt, PublishError> {
        self.publish_json(
            event.topic(),
            &event.partition_key(),
            event.event_type(),
            event,
            self.default_timeout,
        )
        .await
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            unknown_topic: self.counters.unknown_topic.load(Ordering::Relaxed),
        }
    }

    /// Close every writer. Errors are logged per topic; closing continues.
    pub async fn close(&self) {
        for (topic, writer) in &self.writers {
            match writer.close().await {
                Ok(()) => debug!(topic = %topic, "writer closed"),
                Err(err) => warn!(topic = %topic, error = %err, "failed to close writer"),
            }
        }
        info!(stats = ?self.stats(), "publisher pool closed");
    }
}
