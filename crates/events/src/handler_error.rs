use bidbus_core::DomainError;
use thiserror::Error;

use crate::fault::ExceptionInfo;

/// Failure reported by a message handler.
///
/// The variant decides what the consumer does next: `Storage` is transient
/// and the message is retried; everything else is a business rejection and
/// turns into a fault message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Payload does not match the contract for its message type.
    #[error("cannot decode {message_type}: {reason}")]
    Decode { message_type: String, reason: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl HandlerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn decode(message_type: impl Into<String>, err: impl core::fmt::Display) -> Self {
        Self::Decode {
            message_type: message_type.into(),
            reason: err.to_string(),
        }
    }

    /// Stable kind string, used as a correction-table key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Decode { .. } => "decode",
            Self::Storage(_) => "storage",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn to_exception(&self) -> ExceptionInfo {
        let message = match self {
            Self::InvalidArgument(m) | Self::InvariantViolation(m) | Self::Storage(m) => m.clone(),
            Self::Decode { .. } => self.to_string(),
        };
        ExceptionInfo::new(self.kind(), message)
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(m) | DomainError::InvalidId(m) => Self::InvalidArgument(m),
            DomainError::InvariantViolation(m) => Self::InvariantViolation(m),
            other => Self::InvariantViolation(other.to_string()),
        }
    }
}
