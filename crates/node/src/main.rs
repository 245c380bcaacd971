//! Single-process node: the auction service, the search service and the
//! relay between them, wired over the in-memory transport.
//!
//! Writes a few auctions (one of them with a forbidden model), waits for the
//! search index to converge and logs what it holds.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use bidbus_auctions::{AuctionChanges, NewAuction};
use bidbus_events::InMemoryTransport;
use bidbus_infra::config::NodeConfig;
use bidbus_infra::dead_letter::DeadLetterLog;
use bidbus_infra::dispatch::{ConsumerDispatcher, ConsumerPool};
use bidbus_infra::fault_handler::{AUCTION_FAULT_SOURCES, auction_corrections, fault_registry};
use bidbus_infra::outbox::{InMemoryOutbox, OutboxStore};
use bidbus_infra::relay::OutboxRelay;
use bidbus_infra::search::{SearchIndex, search_registry};
use bidbus_infra::auction_writer::AuctionWriter;
use bidbus_infra::store::Database;
use bidbus_infra::topology::bind_auction_topology;

fn listing(make: &str, model: &str, mileage: i32) -> NewAuction {
    NewAuction {
        make: make.into(),
        model: model.into(),
        year: 2020,
        color: "White".into(),
        mileage,
        image_url: format!("https://cdn.example.invalid/{}.jpg", model.to_lowercase()),
        reserve_price: 20_000,
        auction_end: Utc::now() + chrono::Duration::days(10),
    }
}

fn main() -> Result<()> {
    let config = NodeConfig::from_env().context("invalid configuration")?;
    bidbus_observability::init_with(config.log_format);

    info!(
        relay_id = %config.relay.relay_id,
        poll_interval_ms = config.relay.poll_interval.as_millis() as u64,
        workers = config.search.workers,
        "starting node"
    );

    let transport = Arc::new(InMemoryTransport::new(config.transport.visibility_timeout));
    bind_auction_topology(&transport)?;

    let auction_db = Arc::new(Database::new("auctions"));
    let search_db = Arc::new(Database::new("search"));
    let index = SearchIndex::new(search_db.clone());
    let outbox = InMemoryOutbox::new(auction_db.clone());

    let relay = OutboxRelay::new(outbox.clone(), transport.clone(), config.relay.clone()).spawn()?;
    let search = ConsumerPool::new(
        ConsumerDispatcher::new(
            config.search.consumer_id.clone(),
            search_db,
            search_registry(index.store().clone())?,
            transport.clone(),
        ),
        config.search.clone(),
    )
    .spawn()?;
    let faults = ConsumerPool::new(
        ConsumerDispatcher::new(
            config.faults.consumer_id.clone(),
            auction_db.clone(),
            fault_registry(
                config.faults.consumer_id.clone(),
                auction_corrections(),
                &AUCTION_FAULT_SOURCES,
            )?,
            transport.clone(),
        ),
        config.faults.clone(),
    )
    .spawn()?;

    let writer = AuctionWriter::new(auction_db.clone());
    let gt = writer.create("bob", listing("Ford", "GT", 50_000))?;
    let foo = writer.create("alice", listing("Acme", "Foo", 12_000))?;
    let withdrawn = writer.create("bob", listing("Ford", "Focus", 80_000))?;
    writer.update(
        gt.id,
        "bob",
        AuctionChanges {
            mileage: Some(51_200),
            ..Default::default()
        },
    )?;
    writer.delete(withdrawn.id, "bob")?;

    // Compensation needs a second relay pass, so allow a few poll intervals.
    let deadline = Instant::now() + config.relay.poll_interval * 3 + Duration::from_secs(5);
    let converged = || {
        index.get(gt.id).is_some_and(|item| item.mileage == 51_200)
            && index.get(foo.id).is_some_and(|item| item.model != "Foo")
            && index.get(withdrawn.id).is_none()
            && outbox.pending_count().is_ok_and(|n| n == 0)
    };
    while !converged() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    let done = converged();

    for item in index.all() {
        let json = serde_json::to_string(&item)?;
        info!(item = %json, "search item");
    }
    let dead_letters = DeadLetterLog::new(auction_db).len();
    if dead_letters > 0 {
        warn!(dead_letters, "messages were dead-lettered");
    }
    info!(
        relay = ?relay.stats(),
        search = ?search.stats(),
        faults = ?faults.stats(),
        "shutting down"
    );

    relay.shutdown();
    search.shutdown();
    faults.shutdown();

    if !done {
        bail!("search index did not converge before the deadline");
    }
    Ok(())
}
