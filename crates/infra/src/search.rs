//! Search service read model: projects auction events into `search_items`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use bidbus_auctions::contracts::{AUCTION_CREATED, AUCTION_DELETED, AUCTION_UPDATED};
use bidbus_auctions::{AuctionCreated, AuctionDeleted, AuctionUpdated, ensure_listable};
use bidbus_core::AggregateId;
use bidbus_events::{Envelope, HandlerError};

use crate::dispatch::{DispatchError, HandlerRegistry, MessageHandler};
use crate::projection::{Fields, ProjectionStore};
use crate::store::{Database, Transaction};

pub const SEARCH_QUEUE: &str = "search-service";
pub const SEARCH_CONSUMER: &str = "search-service";
pub const SEARCH_ITEMS: &str = "search_items";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchItem {
    pub id: AggregateId,
    pub reserve_price: i32,
    pub seller: String,
    pub winner: Option<String>,
    pub sold_amount: Option<i32>,
    pub current_high_bid: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auction_end: DateTime<Utc>,
    pub status: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    pub image_url: String,
}

impl From<AuctionCreated> for SearchItem {
    fn from(ev: AuctionCreated) -> Self {
        Self {
            id: ev.id,
            reserve_price: ev.reserve_price,
            seller: ev.seller,
            winner: ev.winner,
            sold_amount: ev.sold_amount,
            current_high_bid: ev.current_high_bid,
            created_at: ev.created_at,
            updated_at: ev.updated_at,
            auction_end: ev.auction_end,
            status: ev.status,
            make: ev.make,
            model: ev.model,
            year: ev.year,
            color: ev.color,
            mileage: ev.mileage,
            image_url: ev.image_url,
        }
    }
}

/// Typed read access to the search collection.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    items: ProjectionStore,
}

impl SearchIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            items: ProjectionStore::new(db, SEARCH_ITEMS),
        }
    }

    pub fn store(&self) -> &ProjectionStore {
        &self.items
    }

    pub fn get(&self, id: AggregateId) -> Option<SearchItem> {
        self.items.get(id).and_then(|item| item.decode().ok())
    }

    pub fn all(&self) -> Vec<SearchItem> {
        self.items
            .list()
            .into_iter()
            .filter_map(|item| item.decode().ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, HandlerError> {
    envelope
        .decode()
        .map_err(|e| HandlerError::decode(envelope.message_type(), e))
}

fn to_fields<T: Serialize>(value: &T) -> Result<Fields, HandlerError> {
    match serde_json::to_value(value) {
        Ok(JsonValue::Object(fields)) => Ok(fields),
        Ok(other) => Err(HandlerError::InvariantViolation(format!(
            "expected an object, got {other}"
        ))),
        Err(e) => Err(HandlerError::InvariantViolation(e.to_string())),
    }
}

fn ensure_same_aggregate(envelope: &Envelope, id: AggregateId) -> Result<(), HandlerError> {
    if envelope.aggregate_id() != id {
        return Err(HandlerError::invalid_argument(format!(
            "payload id {id} does not match aggregate {}",
            envelope.aggregate_id()
        )));
    }
    Ok(())
}

pub struct AuctionCreatedProjector {
    items: ProjectionStore,
}

impl MessageHandler for AuctionCreatedProjector {
    fn handle(&self, tx: &mut Transaction<'_>, envelope: &Envelope) -> Result<(), HandlerError> {
        let ev: AuctionCreated = decode(envelope)?;
        ensure_same_aggregate(envelope, ev.id)?;
        ensure_listable(&ev.model)?;

        let fields = to_fields(&SearchItem::from(ev))?;
        let outcome = self.items.upsert(
            tx,
            envelope.aggregate_id(),
            envelope.aggregate_version(),
            fields,
        );
        debug!(aggregate_id = %envelope.aggregate_id(), ?outcome, "search item created");
        Ok(())
    }
}

pub struct AuctionUpdatedProjector {
    items: ProjectionStore,
}

impl MessageHandler for AuctionUpdatedProjector {
    fn handle(&self, tx: &mut Transaction<'_>, envelope: &Envelope) -> Result<(), HandlerError> {
        let ev: AuctionUpdated = decode(envelope)?;
        ensure_same_aggregate(envelope, ev.id)?;

        let mut fields = to_fields(&ev)?;
        fields.remove("id");
        let outcome = self.items.merge(
            tx,
            envelope.aggregate_id(),
            envelope.aggregate_version(),
            fields,
        );
        debug!(aggregate_id = %envelope.aggregate_id(), ?outcome, "search item updated");
        Ok(())
    }
}

pub struct AuctionDeletedProjector {
    items: ProjectionStore,
}

impl MessageHandler for AuctionDeletedProjector {
    fn handle(&self, tx: &mut Transaction<'_>, envelope: &Envelope) -> Result<(), HandlerError> {
        let ev: AuctionDeleted = decode(envelope)?;
        ensure_same_aggregate(envelope, ev.id)?;

        let outcome = self
            .items
            .delete(tx, envelope.aggregate_id(), envelope.aggregate_version());
        debug!(aggregate_id = %envelope.aggregate_id(), ?outcome, "search item deleted");
        Ok(())
    }
}

/// Handlers for every auction event the search service consumes.
pub fn search_registry(items: ProjectionStore) -> Result<HandlerRegistry, DispatchError> {
    let mut registry = HandlerRegistry::new();
    registry.register(
        AUCTION_CREATED,
        AuctionCreatedProjector {
            items: items.clone(),
        },
    )?;
    registry.register(
        AUCTION_UPDATED,
        AuctionUpdatedProjector {
            items: items.clone(),
        },
    )?;
    registry.register(AUCTION_DELETED, AuctionDeletedProjector { items })?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidbus_core::MessageId;
    use chrono::Duration;
    use serde_json::json;

    use crate::projection::ApplyOutcome;

    fn created(id: AggregateId, model: &str) -> AuctionCreated {
        let now = Utc::now();
        AuctionCreated {
            id,
            reserve_price: 20_000,
            seller: "bob".into(),
            winner: None,
            sold_amount: None,
            current_high_bid: None,
            created_at: now,
            updated_at: now,
            auction_end: now + Duration::days(7),
            status: "Live".into(),
            make: "Ford".into(),
            model: model.into(),
            year: 2020,
            color: "White".into(),
            mileage: 50_000,
            image_url: "https://example.invalid/car.jpg".into(),
        }
    }

    fn envelope<T: Serialize>(message_type: &str, id: AggregateId, version: u64, body: &T) -> Envelope {
        Envelope::new(
            MessageId::new(),
            message_type,
            id,
            version,
            Utc::now(),
            serde_json::to_value(body).unwrap(),
        )
    }

    fn apply(db: &Database, registry: &HandlerRegistry, env: &Envelope) -> Result<(), HandlerError> {
        let handler = registry.get(env.message_type()).unwrap();
        let mut tx = db.begin();
        handler.handle(&mut tx, env)?;
        tx.commit().unwrap();
        Ok(())
    }

    fn setup() -> (Arc<Database>, SearchIndex, HandlerRegistry) {
        let db = Arc::new(Database::new("search"));
        let index = SearchIndex::new(db.clone());
        let registry = search_registry(index.store().clone()).unwrap();
        (db, index, registry)
    }

    #[test]
    fn create_then_update_then_delete() {
        let (db, index, registry) = setup();
        let id = AggregateId::new();

        apply(&db, &registry, &envelope(AUCTION_CREATED, id, 1, &created(id, "GT"))).unwrap();
        assert_eq!(index.get(id).unwrap().model, "GT");

        let update = AuctionUpdated {
            id,
            color: Some("Red".into()),
            ..Default::default()
        };
        apply(&db, &registry, &envelope(AUCTION_UPDATED, id, 2, &update)).unwrap();
        let item = index.get(id).unwrap();
        assert_eq!(item.color, "Red");
        assert_eq!(item.model, "GT");

        apply(&db, &registry, &envelope(AUCTION_DELETED, id, 3, &AuctionDeleted { id })).unwrap();
        assert!(index.get(id).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn forbidden_model_is_rejected_without_writing() {
        let (db, index, registry) = setup();
        let id = AggregateId::new();

        let err = apply(&db, &registry, &envelope(AUCTION_CREATED, id, 1, &created(id, "Foo"))).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert_eq!(err.to_exception().message, "Cannot sell cars with name Foo");
        assert!(index.is_empty());
    }

    #[test]
    fn late_create_after_delete_stays_deleted() {
        let (db, index, registry) = setup();
        let id = AggregateId::new();

        apply(&db, &registry, &envelope(AUCTION_DELETED, id, 2, &AuctionDeleted { id })).unwrap();
        apply(&db, &registry, &envelope(AUCTION_CREATED, id, 1, &created(id, "GT"))).unwrap();
        assert!(index.get(id).is_none());
    }

    #[test]
    fn update_that_overtakes_its_create_is_kept() {
        let (db, index, registry) = setup();
        let id = AggregateId::new();
        let update = AuctionUpdated {
            id,
            mileage: Some(99),
            ..Default::default()
        };
        apply(&db, &registry, &envelope(AUCTION_UPDATED, id, 2, &update)).unwrap();
        assert!(index.is_empty());

        apply(&db, &registry, &envelope(AUCTION_CREATED, id, 1, &created(id, "GT"))).unwrap();
        let item = index.get(id).unwrap();
        assert_eq!(item.mileage, 99);
        assert_eq!(item.model, "GT");
        assert_eq!(index.store().get(id).unwrap().version, 2);
    }

    #[test]
    fn update_after_delete_is_missing() {
        let (db, index, registry) = setup();
        let id = AggregateId::new();
        apply(&db, &registry, &envelope(AUCTION_CREATED, id, 1, &created(id, "GT"))).unwrap();
        apply(&db, &registry, &envelope(AUCTION_DELETED, id, 2, &AuctionDeleted { id })).unwrap();

        let mut tx = db.begin();
        let fields = to_fields(&json!({ "mileage": 10 })).unwrap();
        assert_eq!(index.store().merge(&mut tx, id, 3, fields), ApplyOutcome::Missing);
        tx.rollback();
        assert!(index.is_empty());
    }

    #[test]
    fn undecodable_payload_is_a_decode_error() {
        let (db, _, registry) = setup();
        let env = Envelope::new(
            MessageId::new(),
            AUCTION_CREATED,
            AggregateId::new(),
            1,
            Utc::now(),
            json!({ "id": "nope" }),
        );
        assert_eq!(apply(&db, &registry, &env).unwrap_err().kind(), "decode");
    }

    #[test]
    fn payload_for_another_aggregate_is_rejected() {
        let (db, _, registry) = setup();
        let env = envelope(AUCTION_CREATED, AggregateId::new(), 1, &created(AggregateId::new(), "GT"));
        assert_eq!(apply(&db, &registry, &env).unwrap_err().kind(), "invalid_argument");
    }
}
