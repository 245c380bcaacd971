//! Auction service write side.
//!
//! Each command changes the auction document and queues the matching event
//! in the same transaction, so the record and its announcement are never out
//! of step.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use bidbus_auctions::contracts::{AUCTION_CREATED, AUCTION_DELETED, AUCTION_UPDATED};
use bidbus_auctions::{Auction, AuctionChanges, AuctionDeleted, NewAuction};
use bidbus_core::{AggregateId, DomainError};
use bidbus_events::{FaultEnvelope, HandlerError};

use crate::outbox;
use crate::store::{Database, Document, StoreError, Transaction};

pub const AUCTIONS: &str = "auctions";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WriteError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct AuctionWriter {
    db: Arc<Database>,
}

impl AuctionWriter {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn create(&self, seller: &str, new: NewAuction) -> Result<Auction, WriteError> {
        let auction = Auction::open(AggregateId::new(), seller, new, Utc::now())?;

        let mut tx = self.db.begin();
        let message_id = outbox::enqueue_event(&mut tx, auction.id, AUCTION_CREATED, &auction.to_created())?;
        save(&mut tx, &auction)?;
        tx.commit()?;

        info!(auction_id = %auction.id, %message_id, model = %auction.item.model, "auction created");
        Ok(auction)
    }

    pub fn update(
        &self,
        id: AggregateId,
        user: &str,
        changes: AuctionChanges,
    ) -> Result<Auction, WriteError> {
        let mut tx = self.db.begin();
        let mut auction = load(&tx, id)?.ok_or(DomainError::NotFound)?;
        auction.ensure_seller(user)?;
        auction.apply_changes(changes, Utc::now())?;

        let message_id = outbox::enqueue_event(&mut tx, id, AUCTION_UPDATED, &auction.to_updated())?;
        save(&mut tx, &auction)?;
        tx.commit()?;

        info!(auction_id = %id, %message_id, "auction updated");
        Ok(auction)
    }

    pub fn delete(&self, id: AggregateId, user: &str) -> Result<(), WriteError> {
        let mut tx = self.db.begin();
        let auction = load(&tx, id)?.ok_or(DomainError::NotFound)?;
        auction.ensure_seller(user)?;

        let message_id = outbox::enqueue_event(&mut tx, id, AUCTION_DELETED, &AuctionDeleted { id })?;
        tx.remove_document(AUCTIONS, id);
        tx.commit()?;

        info!(auction_id = %id, %message_id, "auction deleted");
        Ok(())
    }

    pub fn get(&self, id: AggregateId) -> Result<Option<Auction>, WriteError> {
        self.db
            .document(AUCTIONS, id)
            .and_then(|doc| doc.body)
            .map(|body| serde_json::from_value(JsonValue::Object(body)).map_err(StoreError::from))
            .transpose()
            .map_err(WriteError::from)
    }

    pub fn list(&self) -> Result<Vec<Auction>, WriteError> {
        let bodies: Vec<_> = self
            .db
            .read()
            .documents
            .iter()
            .filter(|((collection, _), _)| collection == AUCTIONS)
            .filter_map(|(_, doc)| doc.body.clone())
            .collect();
        let mut auctions = bodies
            .into_iter()
            .map(|body| serde_json::from_value::<Auction>(JsonValue::Object(body)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        auctions.sort_by(|a, b| a.item.make.cmp(&b.item.make));
        Ok(auctions)
    }
}

/// Payload of a faulted auction message rebuilt from the current record.
///
/// A create is re-announced with everything the record holds now, so updates
/// made while it was being compensated are carried along. Other message types
/// keep the payload the fault carried.
pub fn current_payload(
    tx: &Transaction<'_>,
    fault: &FaultEnvelope,
) -> Result<Option<JsonValue>, HandlerError> {
    if fault.original_message_type != AUCTION_CREATED {
        return Ok(Some(fault.payload.clone()));
    }
    let Some(auction) = load(tx, fault.aggregate_id)? else {
        return Ok(None);
    };
    let payload = serde_json::to_value(auction.to_created()).map_err(StoreError::from)?;
    Ok(Some(payload))
}

fn load(tx: &Transaction<'_>, id: AggregateId) -> Result<Option<Auction>, StoreError> {
    tx.document(AUCTIONS, id)
        .and_then(|doc| doc.body.clone())
        .map(|body| serde_json::from_value(JsonValue::Object(body)))
        .transpose()
        .map_err(StoreError::from)
}

/// Write the record stamped with the version of the event just queued.
fn save(tx: &mut Transaction<'_>, auction: &Auction) -> Result<(), StoreError> {
    let JsonValue::Object(body) = serde_json::to_value(auction)? else {
        return Err(StoreError::Serialization("auction is not an object".into()));
    };
    let version = tx.aggregate_version(auction.id);
    tx.put_document(
        AUCTIONS,
        auction.id,
        Document {
            version,
            body: Some(body),
            updated_at: auction.updated_at,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::outbox::InMemoryOutbox;

    fn new_auction(model: &str) -> NewAuction {
        NewAuction {
            make: "Ford".into(),
            model: model.into(),
            year: 2020,
            color: "White".into(),
            mileage: 50_000,
            image_url: "https://example.invalid/car.jpg".into(),
            reserve_price: 20_000,
            auction_end: Utc::now() + Duration::days(10),
        }
    }

    fn writer() -> (AuctionWriter, InMemoryOutbox) {
        let db = Arc::new(Database::new("auctions"));
        (AuctionWriter::new(db.clone()), InMemoryOutbox::new(db))
    }

    #[test]
    fn create_stores_record_and_queues_event() {
        let (writer, outbox) = writer();
        let auction = writer.create("bob", new_auction("GT")).unwrap();

        assert_eq!(writer.get(auction.id).unwrap(), Some(auction.clone()));
        let pending = outbox.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_type, AUCTION_CREATED);
        assert_eq!(pending[0].aggregate_id, auction.id);
        assert_eq!(pending[0].payload["model"], "GT");
        assert_eq!(writer.database().document(AUCTIONS, auction.id).unwrap().version, 1);
    }

    #[test]
    fn failed_commit_leaves_neither_record_nor_event() {
        let (writer, outbox) = writer();
        writer.database().fail_next_commits(1);

        let err = writer.create("bob", new_auction("GT")).unwrap_err();
        assert!(matches!(err, WriteError::Store(StoreError::CommitFailed(_))));
        assert!(writer.list().unwrap().is_empty());
        assert!(outbox.all().is_empty());
    }

    #[test]
    fn invalid_input_writes_nothing() {
        let (writer, outbox) = writer();
        let mut bad = new_auction("GT");
        bad.make = " ".into();
        assert!(matches!(
            writer.create("bob", bad),
            Err(WriteError::Domain(DomainError::Validation(_)))
        ));
        assert!(outbox.all().is_empty());
    }

    #[test]
    fn update_and_delete_bump_aggregate_versions() {
        let (writer, outbox) = writer();
        let auction = writer.create("bob", new_auction("GT")).unwrap();

        let changes = AuctionChanges {
            color: Some("Red".into()),
            ..Default::default()
        };
        let updated = writer.update(auction.id, "bob", changes).unwrap();
        assert_eq!(updated.item.color, "Red");
        writer.delete(auction.id, "bob").unwrap();

        let versions: Vec<_> = outbox
            .all()
            .into_iter()
            .map(|m| (m.message_type, m.aggregate_version))
            .collect();
        assert_eq!(
            versions,
            vec![
                (AUCTION_CREATED.to_string(), 1),
                (AUCTION_UPDATED.to_string(), 2),
                (AUCTION_DELETED.to_string(), 3),
            ]
        );
        assert_eq!(writer.get(auction.id).unwrap(), None);
    }

    #[test]
    fn only_the_seller_may_change_an_auction() {
        let (writer, outbox) = writer();
        let auction = writer.create("bob", new_auction("GT")).unwrap();

        assert_eq!(
            writer.delete(auction.id, "alice"),
            Err(WriteError::Domain(DomainError::Unauthorized))
        );
        assert_eq!(
            writer.update(AggregateId::new(), "bob", AuctionChanges::default()),
            Err(WriteError::Domain(DomainError::NotFound))
        );
        assert_eq!(outbox.all().len(), 1);
    }
}
