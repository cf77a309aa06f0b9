use serde::Serialize;

/// An event announced to external consumers.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - routed to exactly one topic
/// - keyed, so every event about the same subject lands in the same partition
///
/// The serialized form of the implementor becomes the envelope `data`.
pub trait Event: Serialize + core::fmt::Debug + Send + Sync {
    /// Stable event name/type identifier (e.g. "payment.recorded").
    fn event_type(&self) -> &'static str;

    /// Topic the event is published on (e.g. "payments.recorded").
    fn topic(&self) -> &'static str;

    /// Partition/ordering key.
    fn partition_key(&self) -> String;
}
