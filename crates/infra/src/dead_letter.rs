//! Terminal failures.
//!
//! A dead letter is a message the system gave up on: a fault with no
//! applicable correction, or a fault whose own handling failed. It is written
//! once, with the consumer's inbox record, and never retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::error;

use bidbus_core::{AggregateId, ConsumerId, MessageId};
use bidbus_events::ExceptionInfo;

use crate::store::{Database, Transaction};

/// Tracing target for dead-letter events, so operators can route them.
pub const DEAD_LETTER_TARGET: &str = "bidbus::dead_letter";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Consumer that gave up.
    pub consumer_id: ConsumerId,
    /// Message that was being handled when it gave up.
    pub message_id: MessageId,
    pub message_type: String,
    pub original_message_id: MessageId,
    pub original_message_type: String,
    pub aggregate_id: AggregateId,
    /// Failure that started it all.
    pub exception: ExceptionInfo,
    /// Why it ended here.
    pub reason: String,
    pub payload: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

/// Persist `letter` with `tx` and report it.
pub fn record(tx: &mut Transaction<'_>, letter: DeadLetter) {
    error!(
        target: DEAD_LETTER_TARGET,
        consumer = %letter.consumer_id,
        message_id = %letter.message_id,
        original_message_id = %letter.original_message_id,
        original_message_type = %letter.original_message_type,
        aggregate_id = %letter.aggregate_id,
        exception_kind = %letter.exception.kind,
        exception = %letter.exception.message,
        reason = %letter.reason,
        "message dead-lettered"
    );
    tx.push_dead_letter(letter);
}

/// Read access to recorded dead letters.
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    db: Arc<Database>,
}

impl DeadLetterLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.db.read().dead_letters.clone()
    }

    pub fn len(&self) -> usize {
        self.db.read().dead_letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_original(&self, original_message_id: MessageId) -> Vec<DeadLetter> {
        self.db
            .read()
            .dead_letters
            .iter()
            .filter(|d| d.original_message_id == original_message_id)
            .cloned()
            .collect()
    }
}
