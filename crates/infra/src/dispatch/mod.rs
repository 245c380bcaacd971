//! Consumer-side dispatch.
//!
//! A [`ConsumerDispatcher`] turns one inbound [`Envelope`] into exactly one
//! applied effect, however many times the envelope is delivered:
//!
//! 1. look up the handler registered for the message type (none: skip);
//! 2. open a transaction and check the inbox (seen: duplicate);
//! 3. run the handler inside the transaction;
//! 4. on success, write the inbox record and commit both together;
//! 5. on a business failure, roll back, publish a fault message, ack;
//! 6. on a transient failure, roll back and let the delivery be retried.
//!
//! A fault message whose own handler fails is not faulted again; it is
//! recorded as a dead letter instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use bidbus_core::{ConsumerId, MessageId};
use bidbus_events::{
    Delivery, Envelope, FaultEnvelope, HandlerError, Transport, TransportError, is_fault_type,
    original_type_of,
};

use crate::dead_letter::{self, DeadLetter};
use crate::inbox;
use crate::store::{Database, StoreError, Transaction};

mod pool;

pub use pool::{ConsumerPool, ConsumerStats, PoolHandle};

/// Applies one message type to a consumer's local store.
///
/// Everything the handler writes must go through `tx`; it commits together
/// with the inbox record or not at all.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, tx: &mut Transaction<'_>, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&mut Transaction<'_>, &Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, tx: &mut Transaction<'_>, envelope: &Envelope) -> Result<(), HandlerError> {
        self(tx, envelope)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("handler already registered for {0}")]
    DuplicateHandler(String),
}

/// Explicit `message_type -> handler` table, built once at start-up.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, message_type: &str, handler: H) -> Result<(), DispatchError>
    where
        H: MessageHandler + 'static,
    {
        if self.handlers.contains_key(message_type) {
            return Err(DispatchError::DuplicateHandler(message_type.to_string()));
        }
        self.handlers
            .insert(message_type.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, message_type: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(message_type)
    }

    /// Registered types, sorted. Used to bind queues.
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran; effect and inbox record committed.
    Applied,
    /// Already in the inbox; handler not invoked.
    Duplicate,
    /// No handler for this type.
    Skipped,
    /// Handler rejected the message; a fault was published.
    Faulted { fault_id: MessageId },
    /// Terminal failure recorded.
    DeadLettered,
    /// Transient failure; nothing committed, redeliver later.
    Retry { error: HandlerError },
}

impl DispatchOutcome {
    /// Whether the transport delivery should be acknowledged.
    pub fn settles(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

pub struct ConsumerDispatcher<T: Transport> {
    consumer_id: ConsumerId,
    db: Arc<Database>,
    registry: HandlerRegistry,
    transport: T,
    publish_timeout: Duration,
    retry_limit: u32,
    retry_interval: Duration,
}

impl<T: Transport> core::fmt::Debug for ConsumerDispatcher<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerDispatcher")
            .field("consumer_id", &self.consumer_id)
            .field("db", &self.db.name())
            .field("registry", &self.registry)
            .finish()
    }
}

impl<T: Transport> ConsumerDispatcher<T> {
    pub fn new(
        consumer_id: ConsumerId,
        db: Arc<Database>,
        registry: HandlerRegistry,
        transport: T,
    ) -> Self {
        Self {
            consumer_id,
            db,
            registry,
            transport,
            publish_timeout: Duration::from_secs(5),
            retry_limit: 0,
            retry_interval: Duration::ZERO,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Retry transient failures in place before giving the delivery back.
    pub fn with_retry(mut self, limit: u32, interval: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_interval = interval;
        self
    }

    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Apply `envelope` once, in effect.
    pub fn dispatch(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let Some(handler) = self.registry.get(envelope.message_type()) else {
            debug!(
                consumer = %self.consumer_id,
                message_id = %envelope.message_id(),
                message_type = envelope.message_type(),
                "no handler registered; skipping"
            );
            return Ok(DispatchOutcome::Skipped);
        };

        let mut tx = self.db.begin();
        if inbox::has_processed(&tx, &self.consumer_id, envelope.message_id()) {
            tx.rollback();
            debug!(
                consumer = %self.consumer_id,
                message_id = %envelope.message_id(),
                "duplicate delivery ignored"
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        match handler.handle(&mut tx, envelope) {
            Ok(()) => {
                inbox::record(&mut tx, &self.consumer_id, envelope);
                tx.commit()?;
                debug!(
                    consumer = %self.consumer_id,
                    message_id = %envelope.message_id(),
                    message_type = envelope.message_type(),
                    "message applied"
                );
                Ok(DispatchOutcome::Applied)
            }
            Err(error) if error.is_transient() => {
                tx.rollback();
                warn!(
                    consumer = %self.consumer_id,
                    message_id = %envelope.message_id(),
                    error = %error,
                    "transient handler failure"
                );
                Ok(DispatchOutcome::Retry { error })
            }
            Err(error) => {
                tx.rollback();
                if is_fault_type(envelope.message_type()) {
                    self.dead_letter_fault(envelope, &error)?;
                    return Ok(DispatchOutcome::DeadLettered);
                }
                let fault_id = self.publish_fault(envelope, &error)?;
                Ok(DispatchOutcome::Faulted { fault_id })
            }
        }
    }

    /// [`dispatch`](Self::dispatch), retrying transient failures in place.
    pub fn dispatch_with_retry(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let mut attempt = 0;
        loop {
            let result = self.dispatch(envelope);
            let retryable = match &result {
                Ok(outcome) => !outcome.settles(),
                Err(DispatchError::Store(_)) => true,
                Err(DispatchError::Transport(e)) => e.is_transient(),
                Err(DispatchError::DuplicateHandler(_)) => false,
            };
            if !retryable || attempt >= self.retry_limit {
                return result;
            }
            attempt += 1;
            debug!(
                consumer = %self.consumer_id,
                message_id = %envelope.message_id(),
                attempt,
                "retrying message"
            );
            thread::sleep(self.retry_interval);
        }
    }

    /// Dispatch a transport delivery and settle it: ack when the outcome is
    /// final, nack (for redelivery) when it is not or when dispatch failed.
    pub fn handle_delivery(&self, delivery: &Delivery) -> Result<DispatchOutcome, DispatchError> {
        match self.dispatch_with_retry(&delivery.envelope) {
            Ok(outcome) if outcome.settles() => {
                self.transport.ack(delivery)?;
                Ok(outcome)
            }
            Ok(outcome) => {
                self.transport.nack(delivery)?;
                Ok(outcome)
            }
            Err(error) => {
                warn!(
                    consumer = %self.consumer_id,
                    message_id = %delivery.envelope.message_id(),
                    delivery_count = delivery.delivery_count,
                    error = %error,
                    "dispatch failed; returning delivery"
                );
                self.transport.nack(delivery)?;
                Err(error)
            }
        }
    }

    fn publish_fault(&self, envelope: &Envelope, error: &HandlerError) -> Result<MessageId, DispatchError> {
        let fault = FaultEnvelope::for_failure(envelope, &self.consumer_id, error.to_exception(), Utc::now());
        let fault_envelope = fault.into_envelope().map_err(StoreError::from)?;
        self.transport
            .publish(&fault_envelope, self.publish_timeout)?;

        info!(
            consumer = %self.consumer_id,
            message_id = %envelope.message_id(),
            message_type = envelope.message_type(),
            fault_id = %fault_envelope.message_id(),
            error = %error,
            "handler rejected message; fault published"
        );

        // Later redeliveries of the original are duplicates from here on.
        let mut tx = self.db.begin();
        inbox::record(&mut tx, &self.consumer_id, envelope);
        if let Err(e) = tx.commit() {
            warn!(
                consumer = %self.consumer_id,
                message_id = %envelope.message_id(),
                error = %e,
                "could not record faulted message; a redelivery will fault again"
            );
        }
        Ok(fault_envelope.message_id())
    }

    fn dead_letter_fault(&self, envelope: &Envelope, error: &HandlerError) -> Result<(), DispatchError> {
        let fault = FaultEnvelope::from_envelope(envelope).ok();
        let mut tx = self.db.begin();
        dead_letter::record(
            &mut tx,
            DeadLetter {
                consumer_id: self.consumer_id.clone(),
                message_id: envelope.message_id(),
                message_type: envelope.message_type().to_string(),
                original_message_id: fault
                    .as_ref()
                    .map_or(envelope.message_id(), |f| f.original_message_id),
                original_message_type: fault.as_ref().map_or_else(
                    || {
                        original_type_of(envelope.message_type())
                            .unwrap_or(envelope.message_type())
                            .to_string()
                    },
                    |f| f.original_message_type.clone(),
                ),
                aggregate_id: envelope.aggregate_id(),
                exception: fault
                    .as_ref()
                    .map_or_else(|| error.to_exception(), |f| f.exception.clone()),
                reason: format!("fault handling failed: {error}"),
                payload: fault.map_or_else(|| envelope.payload().clone(), |f| f.payload),
                recorded_at: Utc::now(),
            },
        );
        inbox::record(&mut tx, &self.consumer_id, envelope);
        tx.commit()?;
        Ok(())
    }
}
