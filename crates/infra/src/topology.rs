//! Queue bindings between the auction and search services.

use bidbus_auctions::contracts::{AUCTION_CREATED, AUCTION_DELETED, AUCTION_UPDATED};
use bidbus_events::{InMemoryTransport, TransportError, fault_type_for};

use crate::fault_handler::{AUCTION_FAULT_SOURCES, FAULT_QUEUE};
use crate::search::SEARCH_QUEUE;

/// Route auction events to the search queue and their faults back to the
/// auction service.
pub fn bind_auction_topology(transport: &InMemoryTransport) -> Result<(), TransportError> {
    for message_type in [AUCTION_CREATED, AUCTION_UPDATED, AUCTION_DELETED] {
        transport.bind(SEARCH_QUEUE, message_type)?;
    }
    for source in AUCTION_FAULT_SOURCES {
        transport.bind(FAULT_QUEUE, &fault_type_for(source))?;
    }
    Ok(())
}
