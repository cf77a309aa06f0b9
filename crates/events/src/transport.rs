//! Messaging substrate abstraction (mechanics only).
//!
//! This module describes the **topic-partitioned log** the publisher pool and
//! the consumer supervisor sit on: writers append keyed messages to a topic,
//! readers pull them back out as members of a consumer group.
//!
//! ## Design Philosophy
//!
//! The transport is intentionally **thin** and makes minimal assumptions:
//!
//! - **Broker-agnostic**: in-memory logs, Redis Streams, Kafka-style brokers
//! - **Per-topic ordering**: a reader observes a topic in the order the broker
//!   delivered it; there is no ordering across topics
//! - **Group offsets live in the broker**: readers resume from the last position
//!   their group committed, the process itself persists nothing
//! - **Bytes in, bytes out**: envelopes are encoded before they reach a writer
//!
//! ## Error classes
//!
//! [`TransportError::is_transient`] separates failures worth retrying (the broker
//! is briefly unreachable, a command timed out) from configuration failures that
//! will never heal on their own (the topic does not exist, the channel was
//! closed). Reader loops back off on the former and stop on the latter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use hap_core::ErrorKind;

/// A message handed to a [`TopicWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// A message pulled from a [`TopicReader`].
///
/// `position` is broker-specific (a log offset, a stream entry id) and is only
/// meaningful when handed back to [`TopicReader::commit`] on the same reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub position: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A broker command failed; retrying may succeed.
    #[error("broker command failed: {0}")]
    Command(String),

    /// The topic cannot be used as configured (e.g. it does not exist).
    #[error("topic {topic} misconfigured: {reason}")]
    Misconfigured { topic: String, reason: String },

    /// The writer/reader was closed.
    #[error("channel for topic {0} is closed")]
    Closed(String),
}

impl TransportError {
    pub fn misconfigured(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Misconfigured {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry after backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_) | TransportError::Command(_))
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Messaging
    }
}

/// Append side of one topic.
///
/// Implementations must be safe for unsynchronised concurrent use: the
/// publisher pool shares one writer per topic between all callers.
#[async_trait]
pub trait TopicWriter: Send + Sync {
    fn topic(&self) -> &str;

    /// Append a message; returns the broker-assigned position.
    async fn write(&self, message: OutboundMessage) -> Result<String, TransportError>;

    /// Flush and release the underlying channel. Later writes fail with `Closed`.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Consume side of one topic, bound to a consumer group.
#[async_trait]
pub trait TopicReader: Send {
    fn topic(&self) -> &str;

    /// Wait (bounded by the implementation's poll window) for the next message.
    ///
    /// `Ok(None)` means the window elapsed with nothing to deliver.
    async fn read(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    /// Record `message` as processed for this reader's consumer group.
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for topic writers and group readers.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, TransportError>;

    async fn reader(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn TopicReader>, TransportError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, TransportError> {
        (**self).writer(topic).await
    }

    async fn reader(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn TopicReader>, TransportError> {
        (**self).reader(topic, group, consumer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_failures_are_transient() {
        assert!(TransportError::Unavailable("down".into()).is_transient());
        assert!(TransportError::Command("timeout".into()).is_transient());
        assert!(!TransportError::misconfigured("t", "missing").is_transient());
        assert!(!TransportError::Closed("t".into()).is_transient());
    }
}
