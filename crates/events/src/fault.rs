//! Fault messages.
//!
//! When a consumer's handler rejects a message for a business reason, the
//! consumer publishes a [`FaultEnvelope`] under the reserved type
//! `fault:<original type>` and acknowledges the original. Fault handlers bind to
//! those reserved types like to any other message type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use bidbus_core::{AggregateId, ConsumerId, MessageId};

use crate::envelope::Envelope;

const FAULT_PREFIX: &str = "fault:";

/// Reserved message type carrying faults of `original`.
pub fn fault_type_for(original: &str) -> String {
    format!("{FAULT_PREFIX}{original}")
}

pub fn is_fault_type(message_type: &str) -> bool {
    message_type.starts_with(FAULT_PREFIX)
}

/// `"fault:AuctionCreated"` -> `Some("AuctionCreated")`.
pub fn original_type_of(message_type: &str) -> Option<&str> {
    message_type.strip_prefix(FAULT_PREFIX)
}

/// Why a correction could not be applied to a faulted payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrectionError {
    /// The payload is not in the state the correction knows how to fix.
    #[error("correction not applicable: {0}")]
    NotApplicable(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Rewrites a faulted payload in place so it can be republished.
pub type Correction = fn(&mut JsonValue) -> Result<(), CorrectionError>;

/// Classified description of a handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Stable machine-readable kind (`invalid_argument`, ...).
    pub kind: String,
    pub message: String,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A rejected message plus what went wrong and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEnvelope {
    pub original_message_id: MessageId,
    pub original_message_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_version: u64,
    /// Consumer whose handler failed.
    pub consumer_id: ConsumerId,
    pub exception: ExceptionInfo,
    /// Original payload, untouched.
    pub payload: JsonValue,
    pub faulted_at: DateTime<Utc>,
}

impl FaultEnvelope {
    pub fn for_failure(
        original: &Envelope,
        consumer_id: &ConsumerId,
        exception: ExceptionInfo,
        faulted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original_message_id: original.message_id(),
            original_message_type: original.message_type().to_string(),
            aggregate_id: original.aggregate_id(),
            aggregate_version: original.aggregate_version(),
            consumer_id: consumer_id.clone(),
            exception,
            payload: original.payload().clone(),
            faulted_at,
        }
    }

    /// Wrap into a publishable envelope.
    ///
    /// The message id is derived from the original id and the consumer so that
    /// a republished fault (after a crash between publish and ack) is
    /// deduplicated by the fault consumer's inbox.
    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        let message_id = fault_message_id(self.original_message_id, &self.consumer_id);
        let message_type = fault_type_for(&self.original_message_type);
        let aggregate_id = self.aggregate_id;
        let aggregate_version = self.aggregate_version;
        let cause = self.original_message_id;
        let faulted_at = self.faulted_at;
        let payload = serde_json::to_value(self)?;
        Ok(Envelope::new(
            message_id,
            message_type,
            aggregate_id,
            aggregate_version,
            faulted_at,
            payload,
        )
        .with_causation(Some(cause)))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        envelope.decode()
    }
}

/// Deterministic id for the fault of `original` raised by `consumer`.
fn fault_message_id(original: MessageId, consumer: &ConsumerId) -> MessageId {
    let name = format!("{}/{}", consumer, original);
    MessageId::from_uuid(uuid::Uuid::new_v5(original.as_uuid(), name.as_bytes()))
}
