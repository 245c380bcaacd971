use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use bidbus_core::{AggregateId, MessageId};

/// A message as it travels from the relay to consumers.
///
/// Notes:
/// - `message_id` is fixed when the row is written to the outbox; every
///   redelivery carries the same id.
/// - `aggregate_version` is the per-aggregate logical clock assigned at
///   enqueue time. Consumers use it to discard stale events.
/// - `payload` stays untyped JSON until a handler decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,
    message_type: String,

    aggregate_id: AggregateId,
    aggregate_version: u64,

    /// Message that caused this one (set on compensations).
    causation_id: Option<MessageId>,

    occurred_at: DateTime<Utc>,
    payload: JsonValue,
}

impl Envelope {
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        aggregate_id: AggregateId,
        aggregate_version: u64,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            aggregate_id,
            aggregate_version,
            causation_id: None,
            occurred_at,
            payload,
        }
    }

    pub fn with_causation(mut self, causation_id: Option<MessageId>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_version(&self) -> u64 {
        self.aggregate_version
    }

    pub fn causation_id(&self) -> Option<MessageId> {
        self.causation_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }

    /// Deserialize the payload into a typed contract.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
