//! Messages on the wire and the transport they travel over.
//!
//! - [`Envelope`]: the unit published by the relay and received by consumers.
//! - [`Transport`]: at-least-once publish/receive/ack abstraction.
//! - [`InMemoryTransport`]: queue-per-consumer broker for tests and single-process runs.
//! - [`FaultEnvelope`]: what a consumer emits when a handler rejects a message.
//! - [`HandlerError`]: how handlers report failure, and how that failure is classified.

pub mod envelope;
pub mod fault;
pub mod handler_error;
pub mod in_memory_transport;
pub mod transport;

pub use envelope::Envelope;
pub use fault::{
    Correction, CorrectionError, ExceptionInfo, FaultEnvelope, fault_type_for, is_fault_type,
    original_type_of,
};
pub use handler_error::HandlerError;
pub use in_memory_transport::InMemoryTransport;
pub use transport::{Delivery, Transport, TransportError};
