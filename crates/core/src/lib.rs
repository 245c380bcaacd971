//! `bidbus-core`: identifiers and the domain error shared by every bidbus crate.
//!
//! Nothing in here knows about storage or transport.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, ConsumerId, MessageId};
