//! Message transport abstraction (mechanics only).
//!
//! A transport moves [`Envelope`]s from the relay to consumer queues. It is the
//! seam between the delivery core and whatever broker runs in production.
//!
//! ## Delivery Guarantees
//!
//! The contract is deliberately weak, and everything above it is built to cope:
//!
//! - **At-least-once**: a delivery that is not acknowledged before its
//!   visibility timeout is handed out again. Consumers deduplicate by
//!   `message_id` through the inbox.
//! - **FIFO within a queue**: deliveries of one queue come out in publish order.
//!   There is no ordering across queues.
//! - **Bounded publish**: `publish` takes a deadline. Exceeding it is a
//!   [`TransportError::Timeout`], which the relay treats like any other
//!   transient failure.
//!
//! ## Routing
//!
//! A published envelope is copied to every queue bound to its `message_type`
//! (fan-out). A type with no bound queue is accepted and dropped, the way an
//! exchange without bindings behaves.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! loop {
//!     match transport.receive("search-service", Duration::from_millis(250))? {
//!         Some(delivery) => {
//!             process(&delivery.envelope)?;
//!             transport.ack(&delivery)?;
//!         }
//!         None => continue, // check for shutdown
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::Envelope;

/// One hand-out of an envelope from a queue.
///
/// `tag` identifies this hand-out for `ack`/`nack`; a redelivery of the same
/// envelope gets a fresh tag and a higher `delivery_count`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub envelope: Envelope,
    pub delivery_count: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker unreachable or refusing work.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Publish did not complete within its deadline.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Ack/nack for a tag that is not in flight (already settled or expired).
    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },

    #[error("transport state poisoned")]
    Poisoned,
}

impl TransportError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// At-least-once publish/subscribe transport.
///
/// Implementations must be `Send + Sync`: the relay and every consumer pool
/// share one transport.
pub trait Transport: Send + Sync {
    /// Publish an envelope to every queue bound to its type.
    fn publish(&self, envelope: &Envelope, deadline: Duration) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next delivery on `queue`.
    fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Settle a delivery; it will not be handed out again.
    fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Return a delivery to the head of its queue for redelivery.
    fn nack(&self, delivery: &Delivery) -> Result<(), TransportError>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn publish(&self, envelope: &Envelope, deadline: Duration) -> Result<(), TransportError> {
        (**self).publish(envelope, deadline)
    }

    fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        (**self).receive(queue, timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        (**self).ack(delivery)
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        (**self).nack(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_and_timeout_are_transient() {
        assert!(TransportError::Unavailable("down".into()).is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!TransportError::UnknownQueue("q".into()).is_transient());
        assert!(!TransportError::Poisoned.is_transient());
    }
}
