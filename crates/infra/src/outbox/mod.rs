//! Transactional outbox.
//!
//! A business mutation and the message describing it are written in the same
//! local transaction ([`enqueue`] only accepts an open [`Transaction`]). The
//! relay later claims unsent rows through an [`OutboxStore`], publishes them,
//! and marks them sent.
//!
//! ## Claiming
//!
//! `claim_batch` leases rows to one relay for a bounded time. A row is
//! claimable when it is unsent, its lease (if any) has expired, and its
//! backoff gate (`next_attempt_at`) has passed. Scanning is in insertion
//! order, and once a row of some aggregate is not claimable no later row of
//! that aggregate is claimed in the same pass. Messages of one aggregate are
//! therefore never published ahead of an earlier, still-pending one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use bidbus_core::{AggregateId, MessageId};
use bidbus_events::Envelope;

use crate::store::{StoreError, Transaction};

mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryOutbox;

/// One pending (or sent) outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub aggregate_id: AggregateId,
    pub aggregate_version: u64,
    pub message_type: String,
    pub payload: JsonValue,
    pub causation_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    /// Whether `claim_batch` may hand this row out at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_sent()
            && self.claimed_until.is_none_or(|until| until <= now)
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(
            self.id,
            self.message_type.clone(),
            self.aggregate_id,
            self.aggregate_version,
            self.created_at,
            self.payload.clone(),
        )
        .with_causation(self.causation_id)
    }
}

/// Queue `payload` for publication as part of `tx`.
///
/// Nothing becomes visible to the relay unless `tx` commits.
pub fn enqueue(
    tx: &mut Transaction<'_>,
    aggregate_id: AggregateId,
    message_type: &str,
    payload: JsonValue,
) -> Result<MessageId, StoreError> {
    insert(tx, aggregate_id, message_type, payload, None)
}

/// [`enqueue`] with a serializable contract.
pub fn enqueue_event<E: Serialize>(
    tx: &mut Transaction<'_>,
    aggregate_id: AggregateId,
    message_type: &str,
    event: &E,
) -> Result<MessageId, StoreError> {
    let payload = serde_json::to_value(event)?;
    insert(tx, aggregate_id, message_type, payload, None)
}

/// [`enqueue`] for a message produced in reaction to `causation_id`.
pub fn enqueue_caused_by(
    tx: &mut Transaction<'_>,
    aggregate_id: AggregateId,
    message_type: &str,
    payload: JsonValue,
    causation_id: MessageId,
) -> Result<MessageId, StoreError> {
    insert(tx, aggregate_id, message_type, payload, Some(causation_id))
}

fn insert(
    tx: &mut Transaction<'_>,
    aggregate_id: AggregateId,
    message_type: &str,
    payload: JsonValue,
    causation_id: Option<MessageId>,
) -> Result<MessageId, StoreError> {
    let id = MessageId::new();
    let aggregate_version = tx.next_aggregate_version(aggregate_id);
    tx.insert_outbox(OutboxMessage {
        id,
        aggregate_id,
        aggregate_version,
        message_type: message_type.to_string(),
        payload,
        causation_id,
        created_at: Utc::now(),
        sent_at: None,
        attempts: 0,
        claimed_by: None,
        claimed_until: None,
        next_attempt_at: None,
        last_error: None,
    });
    Ok(id)
}

/// Relay-facing side of the outbox.
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` claimable rows to `relay_id`, in insertion order.
    fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Record a successful publish. Marking an already-sent row again is a no-op.
    fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a failed publish; the row becomes claimable again at `retry_at`.
    /// Returns the attempt count after the increment.
    fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Drop the lease without counting an attempt.
    fn release(&self, id: MessageId) -> Result<(), StoreError>;

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError>;

    fn pending_count(&self) -> Result<usize, StoreError>;

    /// Delete rows sent before `cutoff`. Returns how many were deleted.
    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).claim_batch(relay_id, limit, lease, now)
    }

    fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_sent(id, sent_at)
    }

    fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        (**self).record_failure(id, error, retry_at)
    }

    fn release(&self, id: MessageId) -> Result<(), StoreError> {
        (**self).release(id)
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        (**self).get(id)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        (**self).pending_count()
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).purge_sent_before(cutoff)
    }
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
