//! Idempotent read-model store.
//!
//! Documents are keyed by aggregate id inside a named collection and carry
//! the `aggregate_version` of the last event applied to them. Every write is
//! guarded by that version, so replays and late arrivals are harmless:
//!
//! | Operation | Stored state | Incoming version | Result |
//! |-----------|--------------|------------------|--------|
//! | `upsert` | none, or older doc/tombstone | any newer | replace, `Applied` |
//! | `merge` | older live doc | newer | overwrite present non-null fields, `Applied` |
//! | `merge` | none | newer than held fields | hold the fields, `Deferred` |
//! | `merge` | older tombstone | newer | no-op, `Missing` |
//! | `delete` | older live doc | newer | tombstone, `Applied` |
//! | `delete` | none or older tombstone | newer | tombstone, `AlreadyAbsent` |
//! | any | version >= incoming | | no-op, `Stale` |
//!
//! The tombstone keeps a late `Create` from resurrecting a deleted document.
//! Held fields cover the opposite race: an update that overtakes its create
//! (a redelivered or compensated create) is folded into the document when the
//! create lands, so the newer fields are not lost.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

use bidbus_core::AggregateId;

use crate::store::{Database, Document, StoreError, Transaction};

pub type Fields = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already at `stored` or newer; nothing written.
    Stale { stored: u64 },
    /// Merge target was deleted; nothing written.
    Missing,
    /// Merge target does not exist yet; fields held for its create.
    Deferred,
    /// Delete of an absent document; tombstone recorded.
    AlreadyAbsent,
}

/// A live document as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub id: AggregateId,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub fields: Fields,
}

impl ProjectionItem {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(T::deserialize(JsonValue::Object(self.fields.clone()))?)
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionStore {
    db: Arc<Database>,
    collection: String,
    held: String,
}

impl ProjectionStore {
    pub fn new(db: Arc<Database>, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        Self {
            db,
            held: format!("{collection}#held"),
            collection,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn stale(&self, tx: &Transaction<'_>, id: AggregateId, version: u64) -> Option<ApplyOutcome> {
        tx.document(&self.collection, id)
            .filter(|doc| doc.version >= version)
            .map(|doc| ApplyOutcome::Stale {
                stored: doc.version,
            })
    }

    /// Create or replace the document.
    pub fn upsert(
        &self,
        tx: &mut Transaction<'_>,
        id: AggregateId,
        version: u64,
        fields: Fields,
    ) -> ApplyOutcome {
        if let Some(stale) = self.stale(tx, id, version) {
            return stale;
        }
        let (version, fields) = match tx.remove_document(&self.held, id) {
            Some(held) if held.version > version => {
                let mut fields = fields;
                overlay(&mut fields, held.body.unwrap_or_default());
                (held.version, fields)
            }
            _ => (version, fields),
        };
        tx.put_document(
            &self.collection,
            id,
            Document {
                version,
                body: Some(fields),
                updated_at: Utc::now(),
            },
        );
        ApplyOutcome::Applied
    }

    /// Overwrite the fields present (and non-null) in `fields`.
    pub fn merge(
        &self,
        tx: &mut Transaction<'_>,
        id: AggregateId,
        version: u64,
        fields: Fields,
    ) -> ApplyOutcome {
        if let Some(stale) = self.stale(tx, id, version) {
            return stale;
        }
        let Some(doc) = tx.document(&self.collection, id) else {
            return self.hold(tx, id, version, fields);
        };
        let Some(mut body) = doc.body.clone() else {
            return ApplyOutcome::Missing;
        };
        overlay(&mut body, fields);
        tx.put_document(
            &self.collection,
            id,
            Document {
                version,
                body: Some(body),
                updated_at: Utc::now(),
            },
        );
        ApplyOutcome::Applied
    }

    pub fn delete(&self, tx: &mut Transaction<'_>, id: AggregateId, version: u64) -> ApplyOutcome {
        if let Some(stale) = self.stale(tx, id, version) {
            return stale;
        }
        let was_live = tx
            .document(&self.collection, id)
            .is_some_and(|doc| doc.body.is_some());
        if tx.document(&self.held, id).is_some_and(|doc| doc.version < version) {
            tx.remove_document(&self.held, id);
        }
        tx.put_document(
            &self.collection,
            id,
            Document {
                version,
                body: None,
                updated_at: Utc::now(),
            },
        );
        if was_live {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::AlreadyAbsent
        }
    }

    fn hold(&self, tx: &mut Transaction<'_>, id: AggregateId, version: u64, fields: Fields) -> ApplyOutcome {
        let mut held = match tx.document(&self.held, id) {
            Some(doc) if doc.version >= version => {
                return ApplyOutcome::Stale {
                    stored: doc.version,
                };
            }
            Some(doc) => doc.body.clone().unwrap_or_default(),
            None => Fields::new(),
        };
        overlay(&mut held, fields);
        tx.put_document(
            &self.held,
            id,
            Document {
                version,
                body: Some(held),
                updated_at: Utc::now(),
            },
        );
        ApplyOutcome::Deferred
    }

    pub fn get(&self, id: AggregateId) -> Option<ProjectionItem> {
        let doc = self.db.document(&self.collection, id)?;
        live_item(id, doc)
    }

    /// Live documents, most recently updated first.
    pub fn list(&self) -> Vec<ProjectionItem> {
        let tables = self.db.read();
        let mut items: Vec<ProjectionItem> = tables
            .documents
            .iter()
            .filter(|((collection, _), _)| collection == &self.collection)
            .filter_map(|((_, id), doc)| live_item(*id, doc.clone()))
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items
    }

    pub fn len(&self) -> usize {
        self.db
            .read()
            .documents
            .iter()
            .filter(|((collection, _), doc)| collection == &self.collection && doc.body.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copy the non-null entries of `fields` over `body`.
fn overlay(body: &mut Fields, fields: Fields) {
    for (key, value) in fields {
        if !value.is_null() {
            body.insert(key, value);
        }
    }
}

fn live_item(id: AggregateId, doc: Document) -> Option<ProjectionItem> {
    Some(ProjectionItem {
        id,
        version: doc.version,
        updated_at: doc.updated_at,
        fields: doc.body?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(value: JsonValue) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn store() -> ProjectionStore {
        ProjectionStore::new(Arc::new(Database::new("search")), "items")
    }

    fn apply<F: FnOnce(&ProjectionStore, &mut Transaction<'_>) -> ApplyOutcome>(
        store: &ProjectionStore,
        f: F,
    ) -> ApplyOutcome {
        let mut tx = store.db.begin();
        let outcome = f(store, &mut tx);
        tx.commit().unwrap();
        outcome
    }

    #[test]
    fn upsert_then_get() {
        let s = store();
        let id = AggregateId::new();
        let outcome = apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT" }))));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(s.get(id).unwrap().fields["model"], "GT");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn replayed_upsert_is_stale() {
        let s = store();
        let id = AggregateId::new();
        apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT" }))));
        let outcome = apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "X" }))));
        assert_eq!(outcome, ApplyOutcome::Stale { stored: 1 });
        assert_eq!(s.get(id).unwrap().fields["model"], "GT");
    }

    #[test]
    fn merge_skips_nulls_and_keeps_other_fields() {
        let s = store();
        let id = AggregateId::new();
        apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT", "color": "White" }))));
        apply(&s, |s, tx| s.merge(tx, id, 2, fields(json!({ "color": "Red", "model": null }))));

        let item = s.get(id).unwrap();
        assert_eq!(item.version, 2);
        assert_eq!(item.fields, fields(json!({ "model": "GT", "color": "Red" })));
    }

    #[test]
    fn merge_before_create_is_held_until_the_create_lands() {
        let s = store();
        let id = AggregateId::new();
        let outcome = apply(&s, |s, tx| s.merge(tx, id, 2, fields(json!({ "color": "Red" }))));
        assert_eq!(outcome, ApplyOutcome::Deferred);
        assert!(s.get(id).is_none());
        assert!(s.is_empty());

        let replay = apply(&s, |s, tx| s.merge(tx, id, 2, fields(json!({ "color": "Blue" }))));
        assert_eq!(replay, ApplyOutcome::Stale { stored: 2 });

        let created = apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT", "color": "White" }))));
        assert_eq!(created, ApplyOutcome::Applied);
        let item = s.get(id).unwrap();
        assert_eq!(item.version, 2);
        assert_eq!(item.fields, fields(json!({ "model": "GT", "color": "Red" })));

        // The held fields are consumed; the original create is now stale.
        let again = apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT", "color": "White" }))));
        assert_eq!(again, ApplyOutcome::Stale { stored: 2 });
    }

    #[test]
    fn newer_create_discards_older_held_fields() {
        let s = store();
        let id = AggregateId::new();
        apply(&s, |s, tx| s.merge(tx, id, 2, fields(json!({ "color": "Red" }))));
        apply(&s, |s, tx| s.upsert(tx, id, 3, fields(json!({ "model": "GT", "color": "Green" }))));

        let item = s.get(id).unwrap();
        assert_eq!(item.version, 3);
        assert_eq!(item.fields["color"], "Green");
    }

    #[test]
    fn merge_after_delete_is_missing() {
        let s = store();
        let id = AggregateId::new();
        apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT" }))));
        apply(&s, |s, tx| s.delete(tx, id, 2));
        let outcome = apply(&s, |s, tx| s.merge(tx, id, 3, fields(json!({ "color": "Red" }))));
        assert_eq!(outcome, ApplyOutcome::Missing);
        assert!(s.get(id).is_none());
    }

    #[test]
    fn delete_of_absent_key_is_a_no_op_that_blocks_late_create() {
        let s = store();
        let id = AggregateId::new();
        assert_eq!(apply(&s, |s, tx| s.delete(tx, id, 3)), ApplyOutcome::AlreadyAbsent);

        let late_create = apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT" }))));
        assert_eq!(late_create, ApplyOutcome::Stale { stored: 3 });
        assert!(s.get(id).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn delete_then_replayed_delete() {
        let s = store();
        let id = AggregateId::new();
        apply(&s, |s, tx| s.upsert(tx, id, 1, fields(json!({ "model": "GT" }))));
        assert_eq!(apply(&s, |s, tx| s.delete(tx, id, 2)), ApplyOutcome::Applied);
        assert_eq!(apply(&s, |s, tx| s.delete(tx, id, 2)), ApplyOutcome::Stale { stored: 2 });
        assert!(s.list().is_empty());
    }

    #[test]
    fn rolled_back_write_leaves_nothing() {
        let s = store();
        let id = AggregateId::new();
        let mut tx = s.db.begin();
        s.upsert(&mut tx, id, 1, fields(json!({ "model": "GT" })));
        tx.rollback();
        assert!(s.get(id).is_none());
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Create,
        Update,
        Delete,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Create), Just(Op::Update), Just(Op::Delete)]
    }

    fn run(s: &ProjectionStore, id: AggregateId, ops: &[(Op, u64)]) {
        for (op, version) in ops {
            let mut tx = s.db.begin();
            match op {
                Op::Create => s.upsert(&mut tx, id, *version, fields(json!({ "v": version, "model": "GT" }))),
                Op::Update => s.merge(&mut tx, id, *version, fields(json!({ "v": version }))),
                Op::Delete => s.delete(&mut tx, id, *version),
            };
            tx.commit().unwrap();
        }
    }

    proptest! {
        /// Applying any sequence once or with every event duplicated gives the same document.
        #[test]
        fn duplicated_delivery_converges(kinds in proptest::collection::vec(op(), 1..12)) {
            let ops: Vec<(Op, u64)> = kinds.into_iter().zip(1u64..).collect();
            let doubled: Vec<(Op, u64)> = ops.iter().flat_map(|e| [*e, *e]).collect();

            let once = store();
            let twice = store();
            let id = AggregateId::new();
            run(&once, id, &ops);
            run(&twice, id, &doubled);

            let a = once.get(id).map(|i| (i.version, i.fields));
            let b = twice.get(id).map(|i| (i.version, i.fields));
            prop_assert_eq!(a, b);
        }
    }
}
