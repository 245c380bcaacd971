//! Consumer inbox: which messages each consumer has already applied.
//!
//! The record is written in the same transaction as the handler's effect, so
//! "applied" and "recorded" are one fact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bidbus_core::{ConsumerId, MessageId};
use bidbus_events::Envelope;

use crate::store::{Database, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub consumer_id: ConsumerId,
    pub message_id: MessageId,
    pub message_type: String,
    pub processed_at: DateTime<Utc>,
}

pub fn has_processed(tx: &Transaction<'_>, consumer_id: &ConsumerId, message_id: MessageId) -> bool {
    tx.tables()
        .inbox
        .contains_key(&(consumer_id.clone(), message_id))
}

/// Record `envelope` as applied by `consumer_id` when `tx` commits.
pub fn record(tx: &mut Transaction<'_>, consumer_id: &ConsumerId, envelope: &Envelope) {
    tx.insert_inbox(InboxRecord {
        consumer_id: consumer_id.clone(),
        message_id: envelope.message_id(),
        message_type: envelope.message_type().to_string(),
        processed_at: Utc::now(),
    });
}

/// Read and housekeeping access to the inbox table.
#[derive(Debug, Clone)]
pub struct InboxStore {
    db: Arc<Database>,
}

impl InboxStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn contains(&self, consumer_id: &ConsumerId, message_id: MessageId) -> bool {
        self.db
            .read()
            .inbox
            .contains_key(&(consumer_id.clone(), message_id))
    }

    /// Records of one consumer, oldest first.
    pub fn records(&self, consumer_id: &ConsumerId) -> Vec<InboxRecord> {
        let mut records: Vec<InboxRecord> = self
            .db
            .read()
            .inbox
            .values()
            .filter(|r| &r.consumer_id == consumer_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.processed_at);
        records
    }

    /// Forget records older than `cutoff`. Messages redelivered after that
    /// would be applied again, so `cutoff` must lie beyond any redelivery window.
    pub fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tables = self.db.write();
        let before = tables.inbox.len();
        tables.inbox.retain(|_, r| r.processed_at >= cutoff);
        before - tables.inbox.len()
    }
}
