//! In-memory broker for tests/dev.
//!
//! - One append-only log per topic, created up front (unknown topics are a
//!   configuration error, as with a broker that has auto-create disabled)
//! - Consumer-group offsets kept per topic; new readers resume from them
//! - Fault injection hooks for exercising retry and timeout paths

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;

use crate::transport::{
    Broker, InboundMessage, OutboundMessage, TopicReader, TopicWriter, TransportError,
};

const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<OutboundMessage>,
    committed: HashMap<String, u64>,
    read_failures: u32,
    write_failures: u32,
    write_delay: Option<Duration>,
}

#[derive(Debug)]
struct Shared {
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
    poll_window: Duration,
}

impl Shared {
    fn with_log<R>(&self, topic: &str, f: impl FnOnce(&mut TopicLog) -> R) -> Result<R, TransportError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| TransportError::Unavailable("in-memory broker lock poisoned".to_string()))?;
        let log = topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::misconfigured(topic, "topic does not exist"))?;
        Ok(f(log))
    }
}

/// In-memory topic log broker.
///
/// Cloning shares the same logs.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_window(DEFAULT_POLL_WINDOW)
    }

    /// `poll_window` bounds how long an idle [`TopicReader::read`] waits.
    pub fn with_poll_window(poll_window: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                poll_window,
            }),
        }
    }

    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let broker = Self::new();
        for topic in topics {
            broker.create_topic(topic.as_ref());
        }
        broker
    }

    /// Create `topic` if it does not exist yet.
    pub fn create_topic(&self, topic: &str) {
        if let Ok(mut topics) = self.shared.topics.lock() {
            topics.entry(topic.to_string()).or_default();
        }
    }

    /// Everything appended to `topic` so far, oldest first.
    pub fn messages(&self, topic: &str) -> Vec<OutboundMessage> {
        self.shared
            .with_log(topic, |log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Next offset `group` will read from on `topic`, if it ever committed.
    pub fn committed_offset(&self, topic: &str, group: &str) -> Option<u64> {
        self.shared
            .with_log(topic, |log| log.committed.get(group).copied())
            .ok()
            .flatten()
    }

    /// Make the next `count` reads on `topic` fail with a transient error.
    pub fn fail_next_reads(&self, topic: &str, count: u32) {
        let _ = self.shared.with_log(topic, |log| log.read_failures = count);
    }

    /// Make the next `count` writes on `topic` fail with a transient error.
    pub fn fail_next_writes(&self, topic: &str, count: u32) {
        let _ = self.shared.with_log(topic, |log| log.write_failures = count);
    }

    /// Delay every write on `topic` (e.g. to trip publish timeouts).
    pub fn set_write_delay(&self, topic: &str, delay: Option<Duration>) {
        let _ = self.shared.with_log(topic, |log| log.write_delay = delay);
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, TransportError> {
        self.shared.with_log(topic, |_| ())?;

        Ok(Arc::new(InMemoryWriter {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn reader(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
    ) -> Result<Box<dyn TopicReader>, TransportError> {
        let next = self
            .shared
            .with_log(topic, |log| log.committed.get(group).copied().unwrap_or(0))?;
        debug!(topic, group, offset = next, "in-memory reader opened");

        Ok(Box::new(InMemoryReader {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: group.to_string(),
            next,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct InMemoryWriter {
    shared: Arc<Shared>,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl TopicWriter for InMemoryWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn write(&self, message: OutboundMessage) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.topic.clone()));
        }

        if let Some(delay) = self.shared.with_log(&self.topic, |log| log.write_delay)? {
            tokio::time::sleep(delay).await;
        }

        let position = self.shared.with_log(&self.topic, |log| {
            if log.write_failures > 0 {
                log.write_failures -= 1;
                return Err(TransportError::Unavailable("injected write failure".to_string()));
            }
            log.entries.push(message);
            Ok(log.entries.len() as u64 - 1)
        })??;

        self.shared.appended.notify_waiters();
        Ok(position.to_string())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryReader {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    next: u64,
    closed: bool,
}

impl InMemoryReader {
    fn try_next(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let offset = self.next;
        let entry = self.shared.with_log(&self.topic, |log| {
            if log.read_failures > 0 {
                log.read_failures -= 1;
                return Err(TransportError::Unavailable("injected read failure".to_string()));
            }
            Ok(log.entries.get(offset as usize).cloned())
        })??;

        Ok(entry.map(|message| {
            self.next += 1;
            InboundMessage {
                topic: self.topic.clone(),
                position: offset.to_string(),
                key: Some(message.key),
                payload: message.payload,
                received_at: Utc::now(),
            }
        }))
    }
}

#[async_trait]
impl TopicReader for InMemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed(self.topic.clone()));
        }

        // Register interest before checking so a concurrent append cannot slip
        // between the check and the wait.
        let shared = Arc::clone(&self.shared);
        let appended = shared.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        if let Some(message) = self.try_next()? {
            return Ok(Some(message));
        }

        let _ = tokio::time::timeout(shared.poll_window, appended).await;
        self.try_next()
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), TransportError> {
        let offset: u64 = message
            .position
            .parse()
            .map_err(|_| TransportError::Command(format!("invalid position {:?}", message.position)))?;

        let group = self.group.clone();
        self.shared.with_log(&self.topic, |log| {
            let committed = log.committed.entry(group).or_insert(0);
            *committed = (*committed).max(offset + 1);
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
