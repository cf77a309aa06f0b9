//! Canonical wire envelope for published events.
//!
//! Every message on every topic is a JSON object of the form
//!
//! ```json
//! {"event_type": "payment.recorded", "timestamp": "2024-05-01T09:30:00Z", "data": { ... }}
//! ```
//!
//! The codec carries no business logic. It stamps the timestamp at encode time
//! and preserves `data` structurally, so `decode(encode(t, p))` yields `t` and
//! `p` unchanged. Envelopes written by the earlier producer used `event` as the
//! type field name; `decode` accepts both spellings.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use hap_core::ErrorKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("event type must not be empty")]
    EmptyEventType,

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Messaging
    }
}

/// Envelope for an event: type tag, UTC instant, opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = JsonValue> {
    #[serde(alias = "event")]
    event_type: String,
    timestamp: DateTime<Utc>,
    data: T,
}

impl<T> Envelope<T> {
    pub fn new(event_type: impl Into<String>, timestamp: DateTime<Utc>, data: T) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            data,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

/// Wrap `data` in an envelope stamped with the current UTC time.
pub fn encode<T: Serialize + ?Sized>(event_type: &str, data: &T) -> Result<Vec<u8>, CodecError> {
    encode_at(event_type, Utc::now(), data)
}

/// Like [`encode`], with an explicit timestamp.
pub fn encode_at<T: Serialize + ?Sized>(
    event_type: &str,
    timestamp: DateTime<Utc>,
    data: &T,
) -> Result<Vec<u8>, CodecError> {
    if event_type.trim().is_empty() {
        return Err(CodecError::EmptyEventType);
    }

    let envelope = Envelope {
        event_type: event_type.to_string(),
        timestamp,
        data,
    };
    serde_json::to_vec(&envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode an envelope, keeping the payload as untyped JSON.
pub fn decode(bytes: &[u8]) -> Result<Envelope<JsonValue>, CodecError> {
    decode_as(bytes)
}

/// Decode an envelope and its payload into `T`.
pub fn decode_as<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, CodecError> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

    if envelope.event_type.trim().is_empty() {
        return Err(CodecError::EmptyEventType);
    }

    Ok(envelope)
}
