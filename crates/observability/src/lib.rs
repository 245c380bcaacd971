//! Process-wide logging setup shared by every binary.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, LogFormatError};

/// Initialize JSON logging. Safe to call more than once.
pub fn init() {
    self::tracing::init_with(LogFormat::Json);
}

/// Initialize logging in the given format. Safe to call more than once.
pub fn init_with(format: LogFormat) {
    self::tracing::init_with(format);
}
