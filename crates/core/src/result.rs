//! Result type definition and extension traits.
//!
//! Best-effort paths (a stop that may fail, a log write) use these combinators
//! to log and move on without unwrap/expect.

use crate::error::Error;

/// The standard Result type for rotor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;

    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, default: T) -> T;

    /// Log the error at warn level with a context label and drop it.
    fn log_best_effort(self, context: &str);
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(kind = e.kind(), "Operation failed: {}", e);
                None
            }
        }
    }

    fn or_default_logged(self, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(kind = e.kind(), "Operation failed, using default: {}", e);
                default
            }
        }
    }

    fn log_best_effort(self, context: &str) {
        if let Err(e) = self {
            tracing::warn!(kind = e.kind(), "{} (best effort): {}", context, e);
        }
    }
}
