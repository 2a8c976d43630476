use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryInterrupt;

/// Broad error category used for retry decisions and caller handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the server.
    RateLimited,
    /// An attempt exceeded its time budget.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
    /// Malformed identifier or envelope.
    Validation,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload for operations driven through the retry executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct CourierError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl CourierError {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build an error for an HTTP response status.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            classify_http_status(status),
            format!("http_{status}"),
            message,
        )
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Suitable as a retry-decision predicate; cancellation is never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::RateLimited | ErrorCategory::Timeout
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }
}

impl From<RetryInterrupt> for CourierError {
    fn from(interrupt: RetryInterrupt) -> Self {
        let category = match interrupt {
            RetryInterrupt::Cancelled => ErrorCategory::Cancelled,
            RetryInterrupt::TimedOut { .. } => ErrorCategory::Timeout,
        };
        let code = match interrupt {
            RetryInterrupt::Cancelled => "aborted",
            RetryInterrupt::TimedOut { .. } => "attempt_timeout",
        };
        Self::new(category, code, interrupt.to_string())
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        408 => ErrorCategory::Timeout,
        429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}
