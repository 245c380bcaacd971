//! Infrastructure layer: transactional outbox, relay, inbox-deduplicated
//! consumers, fault compensation and the search read model.

pub mod auction_writer;
pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod dispatch;
pub mod fault_handler;
pub mod inbox;
pub mod outbox;
pub mod projection;
pub mod relay;
pub mod search;
pub mod store;
pub mod topology;


pub use auction_writer::{AuctionWriter, WriteError};
pub use backoff::Backoff;
pub use config::{ConfigError, ConsumerConfig, NodeConfig, RelayConfig, TransportConfig};
pub use dead_letter::{DeadLetter, DeadLetterLog};
pub use dispatch::{
    ConsumerDispatcher, ConsumerPool, ConsumerStats, DispatchError, DispatchOutcome, HandlerRegistry,
    MessageHandler, PoolHandle,
};
pub use fault_handler::{CorrectionTable, FaultHandler, StateReader, auction_corrections, fault_registry};
pub use inbox::InboxStore;
pub use outbox::{InMemoryOutbox, OutboxMessage, OutboxStore};
pub use projection::{ApplyOutcome, ProjectionItem, ProjectionStore};
pub use relay::{OutboxRelay, RelayHandle, RelayPass, RelayStats};
pub use search::{SearchIndex, SearchItem, search_registry};
pub use store::{Database, Document, StoreError, Transaction};
