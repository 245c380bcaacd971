//! Transactional in-memory database.
//!
//! One [`Database`] stands for one service's local store. It holds every table
//! the delivery core needs (outbox, inbox, documents, dead letters) so that a
//! business mutation, its outbox row and an inbox record can commit or roll
//! back together.
//!
//! ## Transactions
//!
//! [`Database::begin`] takes the write lock for the lifetime of the returned
//! [`Transaction`], which makes transactions serializable. Writes go straight
//! to the tables and are recorded in an undo log:
//!
//! - `commit()` discards the undo log;
//! - `rollback()`, a failed commit, or dropping the transaction (including
//!   during a panic) replays the undo log in reverse.
//!
//! Because of the undo-on-drop, a poisoned lock still guards consistent tables
//! and is recovered rather than propagated.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use bidbus_core::{AggregateId, ConsumerId, MessageId};
use bidbus_events::HandlerError;

use crate::dead_letter::DeadLetter;
use crate::inbox::InboxRecord;
use crate::outbox::OutboxMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("unknown outbox message: {0}")]
    UnknownMessage(MessageId),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(msg) => HandlerError::InvariantViolation(msg),
            other => HandlerError::Storage(other.to_string()),
        }
    }
}

/// A stored JSON document.
///
/// `body == None` is a tombstone: the key was deleted at `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub version: u64,
    pub body: Option<JsonMap<String, JsonValue>>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) type DocumentKey = (String, AggregateId);
pub(crate) type InboxKey = (ConsumerId, MessageId);

#[derive(Debug, Default)]
pub(crate) struct Tables {
    /// Outbox rows by insertion position.
    pub(crate) outbox: BTreeMap<u64, OutboxMessage>,
    pub(crate) outbox_positions: HashMap<MessageId, u64>,
    pub(crate) next_position: u64,
    /// Highest version handed out per aggregate. Survives purges.
    pub(crate) aggregate_versions: HashMap<AggregateId, u64>,
    pub(crate) inbox: HashMap<InboxKey, InboxRecord>,
    pub(crate) documents: HashMap<DocumentKey, Document>,
    pub(crate) dead_letters: Vec<DeadLetter>,
}

impl Tables {
    pub(crate) fn outbox_message_mut(&mut self, id: MessageId) -> Option<&mut OutboxMessage> {
        let position = self.outbox_positions.get(&id)?;
        self.outbox.get_mut(position)
    }
}

#[derive(Debug)]
enum Undo {
    OutboxInsert { position: u64, id: MessageId },
    AggregateVersion { id: AggregateId, previous: Option<u64> },
    InboxInsert(InboxKey),
    Document { key: DocumentKey, previous: Option<Document> },
    DeadLetterPush,
}

/// One service's local store.
#[derive(Debug)]
pub struct Database {
    name: String,
    tables: RwLock<Tables>,
    fail_next_commits: AtomicU32,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(Tables {
                next_position: 1,
                ..Tables::default()
            }),
            fail_next_commits: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a transaction. Blocks while another transaction is open.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            db: self,
            tables: self.write(),
            undo: Vec::new(),
            finished: false,
        }
    }

    /// Make the next `n` commits fail with [`StoreError::CommitFailed`].
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> bool {
        self.fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a document outside any transaction.
    pub fn document(&self, collection: &str, id: AggregateId) -> Option<Document> {
        self.read()
            .documents
            .get(&(collection.to_string(), id))
            .cloned()
    }
}

/// An open, serializable unit of work on a [`Database`].
pub struct Transaction<'db> {
    db: &'db Database,
    tables: RwLockWriteGuard<'db, Tables>,
    undo: Vec<Undo>,
    finished: bool,
}

impl core::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("db", &self.db.name)
            .field("pending_writes", &self.undo.len())
            .finish()
    }
}

impl<'db> Transaction<'db> {
    pub fn database(&self) -> &'db Database {
        self.db
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        if self.db.take_commit_failure() {
            self.undo_all();
            self.finished = true;
            warn!(db = %self.db.name, "commit failed; transaction rolled back");
            return Err(StoreError::CommitFailed(format!(
                "{}: injected commit failure",
                self.db.name
            )));
        }
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.undo_all();
        self.finished = true;
    }

    fn undo_all(&mut self) {
        let writes = self.undo.len();
        while let Some(step) = self.undo.pop() {
            let tables = &mut *self.tables;
            match step {
                Undo::OutboxInsert { position, id } => {
                    tables.outbox.remove(&position);
                    tables.outbox_positions.remove(&id);
                }
                Undo::AggregateVersion { id, previous } => match previous {
                    Some(v) => {
                        tables.aggregate_versions.insert(id, v);
                    }
                    None => {
                        tables.aggregate_versions.remove(&id);
                    }
                },
                Undo::InboxInsert(key) => {
                    tables.inbox.remove(&key);
                }
                Undo::Document { key, previous } => match previous {
                    Some(doc) => {
                        tables.documents.insert(key, doc);
                    }
                    None => {
                        tables.documents.remove(&key);
                    }
                },
                Undo::DeadLetterPush => {
                    tables.dead_letters.pop();
                }
            }
        }
        if writes > 0 {
            debug!(db = %self.db.name, writes, "transaction rolled back");
        }
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Last version handed out for `id` (0 if none).
    pub(crate) fn aggregate_version(&self, id: AggregateId) -> u64 {
        self.tables.aggregate_versions.get(&id).copied().unwrap_or(0)
    }

    /// Hand out the next version for `id`.
    pub(crate) fn next_aggregate_version(&mut self, id: AggregateId) -> u64 {
        let previous = self.tables.aggregate_versions.get(&id).copied();
        let next = previous.unwrap_or(0) + 1;
        self.tables.aggregate_versions.insert(id, next);
        self.undo.push(Undo::AggregateVersion { id, previous });
        next
    }

    pub(crate) fn insert_outbox(&mut self, message: OutboxMessage) {
        let position = self.tables.next_position;
        self.tables.next_position += 1;
        let id = message.id;
        self.tables.outbox_positions.insert(id, position);
        self.tables.outbox.insert(position, message);
        self.undo.push(Undo::OutboxInsert { position, id });
    }

    pub(crate) fn insert_inbox(&mut self, record: InboxRecord) {
        let key = (record.consumer_id.clone(), record.message_id);
        if self.tables.inbox.insert(key.clone(), record).is_none() {
            self.undo.push(Undo::InboxInsert(key));
        }
    }

    pub(crate) fn push_dead_letter(&mut self, letter: DeadLetter) {
        self.tables.dead_letters.push(letter);
        self.undo.push(Undo::DeadLetterPush);
    }

    pub fn document(&self, collection: &str, id: AggregateId) -> Option<&Document> {
        self.tables.documents.get(&(collection.to_string(), id))
    }

    /// Insert or replace a document (a `None` body writes a tombstone).
    pub fn put_document(&mut self, collection: &str, id: AggregateId, document: Document) {
        let key = (collection.to_string(), id);
        let previous = self.tables.documents.insert(key.clone(), document);
        self.undo.push(Undo::Document { key, previous });
    }

    /// Remove a document entirely, leaving no tombstone.
    pub fn remove_document(&mut self, collection: &str, id: AggregateId) -> Option<Document> {
        let key = (collection.to_string(), id);
        let previous = self.tables.documents.remove(&key);
        if previous.is_some() {
            self.undo.push(Undo::Document {
                key,
                previous: previous.clone(),
            });
        }
        previous
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: JsonValue) -> Option<JsonMap<String, JsonValue>> {
        value.as_object().cloned()
    }

    fn doc(version: u64, value: JsonValue) -> Document {
        Document {
            version,
            body: body(value),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn committed_writes_are_visible() {
        let db = Database::new("test");
        let id = AggregateId::new();
        let mut tx = db.begin();
        tx.put_document("things", id, doc(1, json!({ "a": 1 })));
        tx.commit().unwrap();

        assert_eq!(db.document("things", id).unwrap().version, 1);
    }

    #[test]
    fn rollback_restores_previous_document() {
        let db = Database::new("test");
        let id = AggregateId::new();
        let mut tx = db.begin();
        tx.put_document("things", id, doc(1, json!({ "a": 1 })));
        tx.commit().unwrap();

        let mut tx = db.begin();
        tx.put_document("things", id, doc(2, json!({ "a": 2 })));
        tx.remove_document("things", id);
        tx.rollback();

        let stored = db.document("things", id).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.body, body(json!({ "a": 1 })));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let db = Database::new("test");
        let id = AggregateId::new();
        {
            let mut tx = db.begin();
            tx.put_document("things", id, doc(1, json!({})));
            assert_eq!(tx.next_aggregate_version(id), 1);
        }
        assert!(db.document("things", id).is_none());
        assert!(db.read().aggregate_versions.is_empty());
    }

    #[test]
    fn injected_commit_failure_rolls_back_once() {
        let db = Database::new("test");
        let id = AggregateId::new();
        db.fail_next_commits(1);

        let mut tx = db.begin();
        tx.put_document("things", id, doc(1, json!({})));
        assert!(matches!(tx.commit(), Err(StoreError::CommitFailed(_))));
        assert!(db.document("things", id).is_none());

        let mut tx = db.begin();
        tx.put_document("things", id, doc(1, json!({})));
        tx.commit().unwrap();
        assert!(db.document("things", id).is_some());
    }

    #[test]
    fn aggregate_versions_increase_per_aggregate() {
        let db = Database::new("test");
        let a = AggregateId::new();
        let b = AggregateId::new();
        let mut tx = db.begin();
        assert_eq!(tx.next_aggregate_version(a), 1);
        assert_eq!(tx.next_aggregate_version(a), 2);
        assert_eq!(tx.next_aggregate_version(b), 1);
        tx.commit().unwrap();
    }
}
