//! Event envelopes, topics and the messaging substrate.
//!
//! - [`envelope`]: the canonical wire codec
//! - [`topic`]: topic names and the startup topic set
//! - [`transport`]: writer/reader/broker traits with consumer-group semantics
//! - [`in_memory_broker`]: test/dev broker with fault injection

pub mod appointment;
pub mod envelope;
pub mod event;
pub mod in_memory_broker;
pub mod topic;
pub mod transport;

pub use appointment::{AppointmentChange, AppointmentNotice};
pub use envelope::{CodecError, Envelope, decode, decode_as, encode, encode_at};
pub use event::Event;
pub use in_memory_broker::InMemoryBroker;
pub use topic::{TopicError, TopicSet};
pub use transport::{Broker, InboundMessage, OutboundMessage, TopicReader, TopicWriter, TransportError};
