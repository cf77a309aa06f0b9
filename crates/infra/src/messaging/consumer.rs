//! Consumer supervisor: one long-lived reader task per subscribed topic.
//!
//! Each reader walks the state machine
//!
//! ```text
//! Starting -> Reading -> (Applying -> Reading)* -> Stopped
//!                 \-> Backoff -> Reading        (transient read error)
//! ```
//!
//! - transient transport errors are logged, followed by a fixed backoff sleep;
//!   the loop never gives up on them
//! - configuration errors (missing topic, closed channel) stop that topic's
//!   reader; the other topics keep running
//! - every delivered message is committed to the consumer group after the
//!   handler ran, including messages that failed to decode or whose handler
//!   returned an error (they are logged and skipped, not redelivered)
//! - cancellation is observed while waiting for messages and while backing
//!   off; a message already being applied finishes first
//!
//! Read positions live in the broker's consumer group. Restarting the
//! supervisor with the same group resumes after the last committed message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hap_billing::BillingEvent;
use hap_events::{Broker, Envelope, InboundMessage, TopicReader, TopicSet, decode};

pub const DEFAULT_CONSUMER_GROUP: &str = "hap-consumer-group";
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Where a topic reader currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    Starting,
    Reading,
    Applying,
    Backoff,
    Stopped,
}

/// A decoded message handed to an [`EnvelopeHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub position: String,
    pub key: Option<String>,
    pub received_at: DateTime<Utc>,
    pub envelope: Envelope,
}

/// Side effect applied to every delivered envelope.
///
/// Handlers must tolerate replays: a crash between applying and committing
/// delivers the same message again after restart.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Writes one structured audit record per delivered envelope on the
/// `hap::audit` tracing target.
#[derive(Debug, Default)]
pub struct AuditLogHandler {
    observed: AtomicU64,
}

impl AuditLogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes seen so far.
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EnvelopeHandler for AuditLogHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let envelope = &delivery.envelope;

        match BillingEvent::from_envelope(envelope)? {
            Some(event) => {
                let invoice = event.invoice();
                let transition = event.transition();
                tracing::info!(
                    target: "hap::audit",
                    topic = %delivery.topic,
                    position = %delivery.position,
                    event_type = envelope.event_type(),
                    emitted_at = %envelope.timestamp(),
                    invoice_id = %invoice.invoice_id,
                    source = transition.source.as_str(),
                    from = transition.from.as_str(),
                    to = transition.to.as_str(),
                    total_paid = %invoice.total_paid,
                    "billing event"
                );
            }
            None => {
                tracing::info!(
                    target: "hap::audit",
                    topic = %delivery.topic,
                    position = %delivery.position,
                    key = delivery.key.as_deref().unwrap_or(""),
                    event_type = envelope.event_type(),
                    emitted_at = %envelope.timestamp(),
                    data = %envelope.data(),
                    "event"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// Member name inside the group; unique per process.
    pub consumer_name: String,
    pub backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: format!("hap-consumer-{}", std::process::id()),
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Starts the per-topic reader tasks.
#[derive(Debug)]
pub struct ConsumerSupervisor;

impl ConsumerSupervisor {
    /// Spawn one reader task per topic on the current tokio runtime.
    pub fn start(
        broker: Arc<dyn Broker>,
        topics: &TopicSet,
        config: ConsumerConfig,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let config = Arc::new(config);
        let mut readers = BTreeMap::new();

        for topic in topics.iter() {
            let (state_tx, state_rx) = watch::channel(ReaderState::Starting);
            let task = TopicTask {
                topic: topic.to_string(),
                broker: Arc::clone(&broker),
                config: Arc::clone(&config),
                handler: Arc::clone(&handler),
                cancel: cancel.child_token(),
                state: state_tx,
            };
            let join = tokio::spawn(task.run());
            readers.insert(topic.to_string(), ReaderSlot { state: state_rx, join });
        }

        info!(
            topics = %topics,
            group = %config.group_id,
            consumer = %config.consumer_name,
            "consumer supervisor started"
        );

        SupervisorHandle { cancel, readers }
    }
}

#[derive(Debug)]
struct ReaderSlot {
    state: watch::Receiver<ReaderState>,
    join: JoinHandle<()>,
}

/// Owner of the running reader tasks.
#[derive(Debug)]
pub struct SupervisorHandle {
    cancel: CancellationToken,
    readers: BTreeMap<String, ReaderSlot>,
}

impl SupervisorHandle {
    pub fn state(&self, topic: &str) -> Option<ReaderState> {
        self.readers.get(topic).map(|slot| *slot.state.borrow())
    }

    pub fn states(&self) -> Vec<(String, ReaderState)> {
        self.readers
            .iter()
            .map(|(topic, slot)| (topic.clone(), *slot.state.borrow()))
            .collect()
    }

    /// Wait until `topic`'s reader reaches `state`. Returns `false` if the
    /// reader is unknown or finished without getting there.
    pub async fn wait_for(&self, topic: &str, state: ReaderState) -> bool {
        let Some(slot) = self.readers.get(topic) else {
            return false;
        };
        let mut rx = slot.state.clone();
        rx.wait_for(|current| *current == state).await.is_ok()
    }

    /// Cancel all readers and wait for them to stop.
    pub async fn shutdown(self) -> Vec<(String, ReaderState)> {
        self.cancel.cancel();

        let mut finished = Vec::with_capacity(self.readers.len());
        for (topic, slot) in self.readers {
            if let Err(err) = slot.join.await {
                error!(topic = %topic, error = %err, "reader task panicked");
            }
            let state = *slot.state.borrow();
            finished.push((topic, state));
        }

        info!("consumer supervisor stopped");
        finished
    }
}

struct TopicTask {
    topic: String,
    broker: Arc<dyn Broker>,
    config: Arc<ConsumerConfig>,
    handler: Arc<dyn EnvelopeHandler>,
    cancel: CancellationToken,
    state: watch::Sender<ReaderState>,
}

impl TopicTask {
    async fn run(self) {
        if let Some(mut reader) = self.open().await {
            self.read_loop(reader.as_mut()).await;
            if let Err(err) = reader.close().await {
                debug!(topic = %self.topic, error = %err, "reader close failed");
            }
        }

        self.enter(ReaderState::Stopped);
        info!(topic = %self.topic, "reader stopped");
    }

    fn enter(&self, state: ReaderState) {
        self.state.send_replace(state);
    }

    async fn open(&self) -> Option<Box<dyn TopicReader>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let attempt = self
                .broker
                .reader(&self.topic, &self.config.group_id, &self.config.consumer_name)
                .await;

            match attempt {
                Ok(reader) => {
                    debug!(topic = %self.topic, "reader opened");
                    return Some(reader);
                }
                Err(err) if err.is_transient() => {
                    warn!(topic = %self.topic, error = %err, "failed to open reader; retrying");
                    if !self.back_off().await {
                        return None;
                    }
                }
                Err(err) => {
                    error!(topic = %self.topic, error = %err, "cannot open reader; giving up on topic");
                    return None;
                }
            }
        }
    }

    async fn read_loop(&self, reader: &mut dyn TopicReader) {
        loop {
            self.enter(ReaderState::Reading);

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                next = reader.read() => next,
            };

            match next {
                Ok(None) => continue,
                Ok(Some(message)) => {
                    self.enter(ReaderState::Applying);
                    self.apply(reader, message).await;
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        topic = %self.topic,
                        error = %err,
                        backoff_ms = self.config.backoff.as_millis() as u64,
                        "read failed; backing off"
                    );
                    if !self.back_off().await {
                        return;
                    }
                }
                Err(err) => {
                    error!(topic = %self.topic, error = %err, "read failed permanently");
                    return;
                }
            }
        }
    }

    async fn apply(&self, reader: &mut dyn TopicReader, message: InboundMessage) {
        match decode(&message.payload) {
            Ok(envelope) => {
                let delivery = Delivery {
                    topic: message.topic.clone(),
                    position: message.position.clone(),
                    key: message.key.clone(),
                    received_at: message.received_at,
                    envelope,
                };
                if let Err(err) = self.handler.handle(&delivery).await {
                    warn!(
                        topic = %self.topic,
                        position = %message.position,
                        error = %err,
                        "handler failed; skipping message"
                    );
                }
            }
            Err(err) => {
                warn!(
                    topic = %self.topic,
                    position = %message.position,
                    error = %err,
                    "undecodable message; skipping"
                );
            }
        }

        if let Err(err) = reader.commit(&message).await {
            warn!(topic = %self.topic, position = %message.position, error = %err, "commit failed");
        }
    }

    /// Sleep for the backoff interval. Returns `false` if cancelled meanwhile.
    async fn back_off(&self) -> bool {
        self.enter(ReaderState::Backoff);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.backoff) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_events::{InMemoryBroker, encode, topic};
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
            self.seen.lock().await.push(delivery.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EnvelopeHandler for Failing {
        async fn handle(&self, _delivery: &Delivery) -> anyhow::Result<()> {
            anyhow::bail!("downstream unavailable")
        }
    }

    fn config(backoff: Duration) -> ConsumerConfig {
        ConsumerConfig {
            group_id: "test-group".into(),
            consumer_name: "test-consumer".into(),
            backoff,
        }
    }

    async fn append(broker: &InMemoryBroker, topic: &str, event_type: &str, n: u64) {
        let writer = broker.writer(topic).await.unwrap();
        writer
            .write(hap_events::OutboundMessage::new(
                "k",
                encode(event_type, &json!({ "n": n })).unwrap(),
            ))
            .await
            .unwrap();
    }

    async fn wait_until_committed(broker: &InMemoryBroker, topic: &str, group: &str, offset: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.committed_offset(topic, group) != Some(offset) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offset not committed in time");
    }

    #[tokio::test]
    async fn delivers_in_order_and_commits() {
        let broker = InMemoryBroker::with_topics([topic::APPOINTMENTS_CREATED]);
        for n in 0..3 {
            append(&broker, topic::APPOINTMENTS_CREATED, "appointment.created", n).await;
        }

        let recorder = Arc::new(Recorder::default());
        let topics = TopicSet::new([topic::APPOINTMENTS_CREATED]).unwrap();
        let handle = ConsumerSupervisor::start(
            Arc::new(broker.clone()),
            &topics,
            config(DEFAULT_BACKOFF),
            recorder.clone(),
        );

        wait_until_committed(&broker, topic::APPOINTMENTS_CREATED, "test-group", 3).await;
        let states = handle.shutdown().await;
        assert_eq!(states, vec![(topic::APPOINTMENTS_CREATED.to_string(), ReaderState::Stopped)]);

        let seen = recorder.seen.lock().await;
        let order: Vec<u64> = seen.iter().map(|d| d.envelope.data()["n"].as_u64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(seen.iter().all(|d| d.envelope.event_type() == "appointment.created"));
    }

    #[tokio::test]
    async fn poison_messages_are_committed_and_skipped() {
        let broker = InMemoryBroker::with_topics([topic::PAYMENTS_RECORDED]);
        let writer = broker.writer(topic::PAYMENTS_RECORDED).await.unwrap();
        writer
            .write(hap_events::OutboundMessage::new("k", b"not json".to_vec()))
            .await
            .unwrap();
        append(&broker, topic::PAYMENTS_RECORDED, "payment.recorded", 1).await;

        let topics = TopicSet::new([topic::PAYMENTS_RECORDED]).unwrap();
        let handle = ConsumerSupervisor::start(
            Arc::new(broker.clone()),
            &topics,
            config(DEFAULT_BACKOFF),
            Arc::new(Failing),
        );

        wait_until_committed(&broker, topic::PAYMENTS_RECORDED, "test-group", 2).await;
        assert_eq!(handle.state(topic::PAYMENTS_RECORDED).map(|s| s != ReaderState::Stopped), Some(true));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn missing_topic_stops_only_that_reader() {
        let broker = InMemoryBroker::with_topics([topic::APPOINTMENTS_CREATED]);
        let topics = TopicSet::new([topic::APPOINTMENTS_CREATED, "not.provisioned"]).unwrap();

        let handle = ConsumerSupervisor::start(
            Arc::new(broker.clone()),
            &topics,
            config(DEFAULT_BACKOFF),
            Arc::new(Recorder::default()),
        );

        assert!(handle.wait_for("not.provisioned", ReaderState::Stopped).await);
        assert!(handle.wait_for(topic::APPOINTMENTS_CREATED, ReaderState::Reading).await);
        assert_eq!(handle.state("unknown"), None);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let broker = InMemoryBroker::with_topics([topic::APPOINTMENTS_UPDATED]);
        broker.fail_next_reads(topic::APPOINTMENTS_UPDATED, u32::MAX);

        let topics = TopicSet::new([topic::APPOINTMENTS_UPDATED]).unwrap();
        let handle = ConsumerSupervisor::start(
            Arc::new(broker),
            &topics,
            config(Duration::from_secs(3600)),
            Arc::new(Recorder::default()),
        );

        assert!(handle.wait_for(topic::APPOINTMENTS_UPDATED, ReaderState::Backoff).await);

        let states = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown should not wait out the backoff");
        assert_eq!(states[0].1, ReaderState::Stopped);
    }

    #[tokio::test]
    async fn audit_handler_counts_every_envelope() {
        let handler = AuditLogHandler::new();
        let delivery = Delivery {
            topic: topic::APPOINTMENTS_CANCELED.into(),
            position: "0".into(),
            key: None,
            received_at: Utc::now(),
            envelope: Envelope::new("appointment.canceled", Utc::now(), json!({"id": 1})),
        };

        handler.handle(&delivery).await.unwrap();
        handler.handle(&delivery).await.unwrap();
        assert_eq!(handler.observed(), 2);
    }

    #[tokio::test]
    async fn audit_handler_rejects_malformed_billing_payloads() {
        let handler = AuditLogHandler::new();
        let delivery = Delivery {
            topic: topic::PAYMENTS_RECORDED.into(),
            position: "0".into(),
            key: None,
            received_at: Utc::now(),
            envelope: Envelope::new(BillingEvent::PAYMENT_RECORDED, Utc::now(), json!({"bogus": true})),
        };

        assert!(handler.handle(&delivery).await.is_err());
    }
}
