//! Auctions domain: the auction record, the events it publishes, and the
//! listing rules downstream services enforce on them.
//!
//! Pure domain logic (no IO, no storage).

pub mod auction;
pub mod compensation;
pub mod contracts;
pub mod rules;

pub use auction::{Auction, AuctionChanges, AuctionStatus, Item, NewAuction};
pub use compensation::{CORRECTED_MODEL, rename_forbidden_model};
pub use contracts::{AuctionCreated, AuctionDeleted, AuctionUpdated};
pub use rules::{FORBIDDEN_MODEL, ensure_listable};
