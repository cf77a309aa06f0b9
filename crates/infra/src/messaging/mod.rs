//! Messaging runtime: publishing events and supervising topic readers.
//!
//! - [`publisher`]: fixed per-topic writer pool, bounded best-effort publish
//! - [`consumer`]: per-topic reader tasks with backoff and graceful shutdown
//! - `redis_streams`: Redis Streams broker (feature `redis`)

pub mod consumer;
pub mod publisher;

#[cfg(feature = "redis")]
pub mod redis_streams;

pub use consumer::{
    AuditLogHandler, ConsumerConfig, ConsumerSupervisor, Delivery, EnvelopeHandler, ReaderState,
    SupervisorHandle,
};
pub use publisher::{PublishError, PublishReceipt, PublishStats, PublisherPool};

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
