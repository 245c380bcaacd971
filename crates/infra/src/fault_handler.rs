//! Fault consumer: compensates rejected messages or gives up on them.
//!
//! A [`CorrectionTable`] maps `(original message type, exception kind)` to a
//! [`Correction`]. When a fault arrives and a correction applies, the
//! corrected payload is queued in the outbox under the original message type
//! (in the fault consumer's transaction) and travels the normal pipeline
//! again. Anything else ends as exactly one dead letter.
//!
//! The payload corrected is the aggregate's current state when the table has
//! a [`StateReader`], not the snapshot carried by the fault. Changes committed
//! while the fault was in flight therefore survive the compensation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::info;

use bidbus_auctions::contracts::{AUCTION_CREATED, AUCTION_DELETED, AUCTION_UPDATED};
use bidbus_auctions::rename_forbidden_model;
use bidbus_core::ConsumerId;
use bidbus_events::{Correction, Envelope, FaultEnvelope, HandlerError, fault_type_for};

use crate::auction_writer;
use crate::dead_letter::{self, DeadLetter};
use crate::dispatch::{DispatchError, HandlerRegistry, MessageHandler};
use crate::outbox;
use crate::store::Transaction;

pub const FAULT_QUEUE: &str = "auction-faults";
pub const FAULT_CONSUMER: &str = "auction-service";

/// Message types whose faults the auction service consumes.
pub const AUCTION_FAULT_SOURCES: [&str; 3] = [AUCTION_CREATED, AUCTION_UPDATED, AUCTION_DELETED];

/// Reads the payload to correct from the local store.
///
/// `Ok(None)` means the aggregate no longer exists.
pub type StateReader = fn(&Transaction<'_>, &FaultEnvelope) -> Result<Option<JsonValue>, HandlerError>;

#[derive(Debug, Clone, Default)]
pub struct CorrectionTable {
    corrections: HashMap<(String, String), Correction>,
    state: Option<StateReader>,
}

impl CorrectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, message_type: &str, exception_kind: &str, correction: Correction) -> Self {
        self.corrections
            .insert((message_type.to_string(), exception_kind.to_string()), correction);
        self
    }

    pub fn with_state_reader(mut self, reader: StateReader) -> Self {
        self.state = Some(reader);
        self
    }

    /// Payload a correction should start from.
    pub fn current_payload(
        &self,
        tx: &Transaction<'_>,
        fault: &FaultEnvelope,
    ) -> Result<Option<JsonValue>, HandlerError> {
        match self.state {
            Some(read) => read(tx, fault),
            None => Ok(Some(fault.payload.clone())),
        }
    }

    pub fn lookup(&self, message_type: &str, exception_kind: &str) -> Option<Correction> {
        self.corrections
            .get(&(message_type.to_string(), exception_kind.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.corrections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty()
    }
}

/// Corrections the auction service knows how to make.
pub fn auction_corrections() -> CorrectionTable {
    CorrectionTable::new()
        .with(AUCTION_CREATED, "invalid_argument", rename_forbidden_model)
        .with_state_reader(auction_writer::current_payload)
}

#[derive(Debug, Clone)]
pub struct FaultHandler {
    consumer_id: ConsumerId,
    corrections: Arc<CorrectionTable>,
}

impl FaultHandler {
    pub fn new(consumer_id: ConsumerId, corrections: Arc<CorrectionTable>) -> Self {
        Self {
            consumer_id,
            corrections,
        }
    }

    fn give_up(&self, tx: &mut Transaction<'_>, envelope: &Envelope, fault: FaultEnvelope, reason: String) {
        dead_letter::record(
            tx,
            DeadLetter {
                consumer_id: self.consumer_id.clone(),
                message_id: envelope.message_id(),
                message_type: envelope.message_type().to_string(),
                original_message_id: fault.original_message_id,
                original_message_type: fault.original_message_type,
                aggregate_id: fault.aggregate_id,
                exception: fault.exception,
                reason,
                payload: fault.payload,
                recorded_at: Utc::now(),
            },
        );
    }
}

impl MessageHandler for FaultHandler {
    fn handle(&self, tx: &mut Transaction<'_>, envelope: &Envelope) -> Result<(), HandlerError> {
        let fault = FaultEnvelope::from_envelope(envelope)
            .map_err(|e| HandlerError::decode(envelope.message_type(), e))?;

        let Some(correct) = self
            .corrections
            .lookup(&fault.original_message_type, &fault.exception.kind)
        else {
            let reason = format!(
                "no correction for {} / {}",
                fault.original_message_type, fault.exception.kind
            );
            self.give_up(tx, envelope, fault, reason);
            return Ok(());
        };

        let Some(mut payload) = self.corrections.current_payload(tx, &fault)? else {
            let reason = format!("aggregate {} no longer exists", fault.aggregate_id);
            self.give_up(tx, envelope, fault, reason);
            return Ok(());
        };
        if let Err(e) = correct(&mut payload) {
            self.give_up(tx, envelope, fault, e.to_string());
            return Ok(());
        }

        let corrected_id = outbox::enqueue_caused_by(
            tx,
            fault.aggregate_id,
            &fault.original_message_type,
            payload,
            fault.original_message_id,
        )?;
        info!(
            consumer = %self.consumer_id,
            original_message_id = %fault.original_message_id,
            message_type = %fault.original_message_type,
            aggregate_id = %fault.aggregate_id,
            corrected_message_id = %corrected_id,
            "fault compensated; corrected message queued"
        );
        Ok(())
    }
}

/// Registry routing `fault:<type>` for each of `sources` to one [`FaultHandler`].
pub fn fault_registry(
    consumer_id: ConsumerId,
    corrections: CorrectionTable,
    sources: &[&str],
) -> Result<HandlerRegistry, DispatchError> {
    let handler = FaultHandler::new(consumer_id, Arc::new(corrections));
    let mut registry = HandlerRegistry::new();
    for source in sources {
        registry.register(&fault_type_for(source), handler.clone())?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidbus_core::{AggregateId, MessageId};
    use bidbus_events::{CorrectionError, ExceptionInfo};
    use serde_json::{Value as JsonValue, json};

    use bidbus_auctions::{AuctionChanges, AuctionCreated, NewAuction};

    use crate::auction_writer::AuctionWriter;
    use crate::dead_letter::DeadLetterLog;
    use crate::outbox::InMemoryOutbox;
    use crate::store::Database;

    fn new_auction(model: &str) -> NewAuction {
        NewAuction {
            make: "Ford".into(),
            model: model.into(),
            year: 2020,
            color: "White".into(),
            mileage: 50_000,
            image_url: "https://example.invalid/car.jpg".into(),
            reserve_price: 20_000,
            auction_end: Utc::now() + chrono::Duration::days(10),
        }
    }

    fn fault_envelope(original_type: &str, kind: &str, payload: JsonValue) -> (Envelope, Envelope) {
        let original = Envelope::new(MessageId::new(), original_type, AggregateId::new(), 1, Utc::now(), payload);
        let consumer = ConsumerId::new("search-service").unwrap();
        let fault = FaultEnvelope::for_failure(&original, &consumer, ExceptionInfo::new(kind, "rejected"), Utc::now())
            .into_envelope()
            .unwrap();
        (original, fault)
    }

    fn handler() -> FaultHandler {
        FaultHandler::new(
            ConsumerId::new(FAULT_CONSUMER).unwrap(),
            Arc::new(auction_corrections()),
        )
    }

    fn no_op(_: &mut JsonValue) -> Result<(), CorrectionError> {
        Ok(())
    }

    #[test]
    fn table_lookup_is_keyed_by_type_and_kind() {
        let table = auction_corrections().with("Other", "decode", no_op);
        assert!(table.lookup(AUCTION_CREATED, "invalid_argument").is_some());
        assert!(table.lookup(AUCTION_CREATED, "decode").is_none());
        assert!(table.lookup(AUCTION_UPDATED, "invalid_argument").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn compensable_fault_queues_corrected_original_type() {
        let db = Database::new("auctions");
        let (original, fault) = fault_envelope(AUCTION_CREATED, "invalid_argument", json!({ "model": "Foo" }));

        let mut tx = db.begin();
        let carried = FaultHandler::new(
            ConsumerId::new(FAULT_CONSUMER).unwrap(),
            Arc::new(CorrectionTable::new().with(AUCTION_CREATED, "invalid_argument", rename_forbidden_model)),
        );
        carried.handle(&mut tx, &fault).unwrap();
        tx.commit().unwrap();

        let db = Arc::new(db);
        let pending = InMemoryOutbox::new(db.clone()).pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_type, AUCTION_CREATED);
        assert_eq!(pending[0].payload, json!({ "model": "FooBar" }));
        assert_eq!(pending[0].aggregate_id, original.aggregate_id());
        assert_eq!(pending[0].causation_id, Some(original.message_id()));
        assert!(DeadLetterLog::new(db).is_empty());
    }

    #[test]
    fn correction_starts_from_the_current_record() {
        let db = Arc::new(Database::new("auctions"));
        let writer = AuctionWriter::new(db.clone());
        let auction = writer.create("bob", new_auction("Foo")).unwrap();
        let stale = auction.to_created();
        writer
            .update(auction.id, "bob", AuctionChanges { mileage: Some(99), ..Default::default() })
            .unwrap();

        let original = Envelope::new(
            MessageId::new(),
            AUCTION_CREATED,
            auction.id,
            1,
            Utc::now(),
            serde_json::to_value(&stale).unwrap(),
        );
        let fault = FaultEnvelope::for_failure(
            &original,
            &ConsumerId::new("search-service").unwrap(),
            ExceptionInfo::new("invalid_argument", "Cannot sell cars with name Foo"),
            Utc::now(),
        )
        .into_envelope()
        .unwrap();

        let mut tx = db.begin();
        handler().handle(&mut tx, &fault).unwrap();
        tx.commit().unwrap();

        let corrected: Vec<_> = InMemoryOutbox::new(db.clone())
            .pending()
            .into_iter()
            .filter(|m| m.causation_id == Some(original.message_id()))
            .collect();
        assert_eq!(corrected.len(), 1);
        assert_eq!(corrected[0].aggregate_version, 3);
        let payload: AuctionCreated = serde_json::from_value(corrected[0].payload.clone()).unwrap();
        assert_eq!(payload.model, "FooBar");
        assert_eq!(payload.mileage, 99);
    }

    #[test]
    fn fault_for_a_deleted_auction_is_dead_lettered() {
        let db = Arc::new(Database::new("auctions"));
        let (_, fault) = fault_envelope(AUCTION_CREATED, "invalid_argument", json!({ "model": "Foo" }));

        let mut tx = db.begin();
        handler().handle(&mut tx, &fault).unwrap();
        tx.commit().unwrap();

        let letters = DeadLetterLog::new(db.clone()).list();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].reason.contains("no longer exists"));
        assert!(InMemoryOutbox::new(db).pending().is_empty());
    }

    #[test]
    fn unknown_kind_is_dead_lettered_once() {
        let db = Arc::new(Database::new("auctions"));
        let (original, fault) = fault_envelope(AUCTION_CREATED, "invariant_violation", json!({ "model": "GT" }));

        let mut tx = db.begin();
        handler().handle(&mut tx, &fault).unwrap();
        tx.commit().unwrap();

        let letters = DeadLetterLog::new(db.clone()).list();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].original_message_id, original.message_id());
        assert_eq!(letters[0].exception.kind, "invariant_violation");
        assert!(InMemoryOutbox::new(db).pending().is_empty());
    }

    #[test]
    fn inapplicable_correction_is_dead_lettered() {
        let db = Arc::new(Database::new("auctions"));
        let auction = AuctionWriter::new(db.clone()).create("bob", new_auction("GT")).unwrap();
        let outbox = InMemoryOutbox::new(db.clone());
        let created = outbox.pending().remove(0);
        let fault = FaultEnvelope::for_failure(
            &created.to_envelope(),
            &ConsumerId::new("search-service").unwrap(),
            ExceptionInfo::new("invalid_argument", "rejected"),
            Utc::now(),
        )
        .into_envelope()
        .unwrap();

        let mut tx = db.begin();
        handler().handle(&mut tx, &fault).unwrap();
        tx.commit().unwrap();

        let letters = DeadLetterLog::new(db.clone()).list();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].aggregate_id, auction.id);
        assert!(letters[0].reason.contains("not applicable"));
        assert_eq!(outbox.pending().len(), 1);
    }

    #[test]
    fn unreadable_fault_is_a_decode_error() {
        let db = Database::new("auctions");
        let bogus = Envelope::new(MessageId::new(), "fault:AuctionCreated", AggregateId::new(), 1, Utc::now(), json!(42));
        let mut tx = db.begin();
        let err = handler().handle(&mut tx, &bogus).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn registry_covers_every_source_fault_type() {
        let registry = fault_registry(
            ConsumerId::new(FAULT_CONSUMER).unwrap(),
            auction_corrections(),
            &AUCTION_FAULT_SOURCES,
        )
        .unwrap();
        assert_eq!(
            registry.message_types(),
            vec!["fault:AuctionCreated", "fault:AuctionDeleted", "fault:AuctionUpdated"]
        );
    }
}
