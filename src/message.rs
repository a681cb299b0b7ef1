//! The delivery envelope produced by receivers and consumed by senders.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MessagingError, Result};
use crate::offset::QueueOffset;

/// Marker bound for payload types carried across the broker boundary.
///
/// Payloads are JSON on the wire for every backend, so anything serde can
/// round-trip qualifies.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Message identity, unique within its queue.
///
/// Derived from broker-native coordinates (`topic/partition@offset`, stream
/// entry id, SQS message id) so redeliveries of the same message carry the
/// same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// How a message entered the current delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// First delivery on the primary flow.
    #[default]
    New,
    /// Redelivered after an earlier failed attempt.
    Retry,
    /// Routed to an error queue after a non-recoverable failure.
    Error,
}

impl DeliveryMode {
    /// Wire label carried by brokers that transport the mode out of band
    /// (headers, attributes, extra fields).
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::New => "new",
            DeliveryMode::Retry => "retry",
            DeliveryMode::Error => "error",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "new" => Some(DeliveryMode::New),
            "retry" => Some(DeliveryMode::Retry),
            "error" => Some(DeliveryMode::Error),
            _ => None,
        }
    }
}

/// Envelope around one decoded broker message.
///
/// Produced by a receiver, consumed by the caller, and never mutated after
/// creation except by [`MessageObject::into_dead_letter`] when routing to an
/// error queue.
#[derive(Debug, Clone)]
pub struct MessageObject<V> {
    /// Unique within the source queue; preserved across dead-letter re-wraps.
    pub id: MessageId,
    /// Partition/routing key, when the broker carries one.
    pub key: Option<String>,
    /// Decoded payload.
    pub value: V,
    /// Queue the message was read from (or is addressed to).
    pub queue: String,
    /// Correlates causally-linked message chains.
    pub correlation_id: Option<String>,
    pub mode: DeliveryMode,
    /// Broker position this message was read at, when the broker has one.
    pub offset: Option<QueueOffset>,
}

impl<V> MessageObject<V> {
    pub fn new(id: MessageId, queue: impl Into<String>, value: V) -> Self {
        Self {
            id,
            key: None,
            value,
            queue: queue.into(),
            correlation_id: None,
            mode: DeliveryMode::New,
            offset: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Start a new correlation chain with a generated id.
    pub fn with_new_correlation_id(self) -> Self {
        self.with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_offset(mut self, offset: QueueOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Re-wrap for the error queue: the original id, key, payload and
    /// correlation id are preserved; only the target queue and the delivery
    /// mode change. Dead-lettering is completion, not retry: the primary
    /// flow's offset advances past the message.
    pub fn into_dead_letter(self, error_queue: impl Into<String>) -> Self {
        Self {
            queue: error_queue.into(),
            mode: DeliveryMode::Error,
            offset: None,
            ..self
        }
    }
}

impl<V: Serialize> MessageObject<V> {
    /// JSON wire encoding of the payload.
    pub fn encoded_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.value)
            .map_err(|e| MessagingError::decode(self.queue.clone(), e))
    }
}

/// Decode a broker payload into the caller's type, with queue context on
/// failure.
pub(crate) fn decode_payload<V: DeserializeOwned>(queue: &str, bytes: &[u8]) -> Result<V> {
    serde_json::from_slice(bytes).map_err(|e| MessagingError::decode(queue, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ContentChanged {
        content_id: String,
        revision: u32,
    }

    #[test]
    fn test_payload_round_trip() {
        let message = MessageObject::new(
            MessageId::new("cdc.content/0@42"),
            "cdc.content",
            ContentChanged {
                content_id: "c-1".into(),
                revision: 7,
            },
        )
        .with_key("c-1");

        let bytes = message.encoded_payload().unwrap();
        let decoded: ContentChanged = decode_payload("cdc.content", &bytes).unwrap();
        assert_eq!(decoded, message.value);
    }

    #[test]
    fn test_decode_failure_names_queue() {
        let err = decode_payload::<ContentChanged>("cdc.content", b"not json").unwrap_err();
        assert!(matches!(err, MessagingError::Decode { ref queue, .. } if queue == "cdc.content"));
    }

    #[test]
    fn test_dead_letter_preserves_identity() {
        let message = MessageObject::new(MessageId::new("archive@3"), "archive", 42u32)
            .with_correlation_id("corr-9")
            .with_offset(QueueOffset::Log {
                queue: "archive".into(),
                position: 3,
            });

        let dead = message.into_dead_letter("archive.errors");
        assert_eq!(dead.id, MessageId::new("archive@3"));
        assert_eq!(dead.queue, "archive.errors");
        assert_eq!(dead.mode, DeliveryMode::Error);
        assert_eq!(dead.correlation_id.as_deref(), Some("corr-9"));
        assert!(dead.offset.is_none());
    }
}
