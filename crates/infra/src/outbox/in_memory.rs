use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use bidbus_core::{AggregateId, MessageId};

use super::{OutboxMessage, OutboxStore, later};
use crate::store::{Database, StoreError};

/// [`OutboxStore`] over the outbox table of a [`Database`].
#[derive(Debug, Clone)]
pub struct InMemoryOutbox {
    db: Arc<Database>,
}

impl InMemoryOutbox {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Unsent rows in insertion order.
    pub fn pending(&self) -> Vec<OutboxMessage> {
        self.db
            .read()
            .outbox
            .values()
            .filter(|m| !m.is_sent())
            .cloned()
            .collect()
    }

    /// Every row (sent or not) in insertion order.
    pub fn all(&self) -> Vec<OutboxMessage> {
        self.db.read().outbox.values().cloned().collect()
    }
}

impl OutboxStore for InMemoryOutbox {
    fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut tables = self.db.write();
        let claimed_until = later(now, lease);
        let mut blocked: HashSet<AggregateId> = HashSet::new();
        let mut claimed = Vec::new();

        for message in tables.outbox.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if message.is_sent() || blocked.contains(&message.aggregate_id) {
                continue;
            }
            if !message.is_claimable(now) {
                blocked.insert(message.aggregate_id);
                continue;
            }
            message.claimed_by = Some(relay_id.to_string());
            message.claimed_until = Some(claimed_until);
            claimed.push(message.clone());
        }

        if !claimed.is_empty() {
            debug!(relay = relay_id, claimed = claimed.len(), "outbox batch claimed");
        }
        Ok(claimed)
    }

    fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.db.write();
        let message = tables
            .outbox_message_mut(id)
            .ok_or(StoreError::UnknownMessage(id))?;
        if message.sent_at.is_none() {
            message.sent_at = Some(sent_at);
        }
        message.claimed_by = None;
        message.claimed_until = None;
        Ok(())
    }

    fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut tables = self.db.write();
        let message = tables
            .outbox_message_mut(id)
            .ok_or(StoreError::UnknownMessage(id))?;
        message.attempts += 1;
        message.last_error = Some(error.to_string());
        message.next_attempt_at = Some(retry_at);
        message.claimed_by = None;
        message.claimed_until = None;
        Ok(message.attempts)
    }

    fn release(&self, id: MessageId) -> Result<(), StoreError> {
        let mut tables = self.db.write();
        let message = tables
            .outbox_message_mut(id)
            .ok_or(StoreError::UnknownMessage(id))?;
        message.claimed_by = None;
        message.claimed_until = None;
        Ok(())
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        let tables = self.db.read();
        Ok(tables
            .outbox_positions
            .get(&id)
            .and_then(|p| tables.outbox.get(p))
            .cloned())
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.db.read().outbox.values().filter(|m| !m.is_sent()).count())
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.db.write();
        let doomed: Vec<(u64, MessageId)> = tables
            .outbox
            .iter()
            .filter(|(_, m)| m.sent_at.is_some_and(|at| at < cutoff))
            .map(|(position, m)| (*position, m.id))
            .collect();
        for (position, id) in &doomed {
            tables.outbox.remove(position);
            tables.outbox_positions.remove(id);
        }
        Ok(doomed.len())
    }
}
