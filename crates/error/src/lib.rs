//! # sluice-error
//!
//! Unified error types for the sluice query execution engine.
//!
//! Every error carries:
//! - A stable numeric code (SLUICE-XXXX)
//! - Optional structured JSON context
//! - An optional hint for the caller
//!
//! Errors fall into two severities (see [`SluiceError::is_component_error`]):
//! processing errors are expected and user facing, component errors are
//! internal faults that force a request to close.

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;
pub use convert::closest_match;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type for all sluice operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SluiceError {
    /// Numeric error code (e.g., "SLUICE-2001")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl SluiceError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
        }
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Shorthand for an internal invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    /// The error every receiver of a cancelled request gets.
    pub fn cancelled(request: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::QueryCancelled,
            format!("Request {} was cancelled", request),
        )
    }

    /// Error for a connector name that is not registered, with a "did you mean" hint.
    pub fn source_not_found(name: &str, available: &[String]) -> Self {
        let mut error = Self::new(
            ErrorCode::SourceNotFound,
            format!("Connector '{}' is not registered", name),
        );
        if let Some(closest) = closest_match(name, available) {
            error = error.with_hint(format!("Did you mean '{}'?", closest));
        }
        error
    }

    /// Component errors are unexpected internal faults: they are logged at
    /// high severity and always force the affected request to close.
    pub fn is_component_error(&self) -> bool {
        matches!(
            self.code.category(),
            ErrorCategory::Scheduling | ErrorCategory::Internal
        )
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize SluiceError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for SluiceError {}

/// Result type alias for sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sluice_error_builder() {
        let err = SluiceError::new(ErrorCode::SourceNotFound, "Source not found")
            .with_hint("Check the connector registry");

        assert_eq!(err.code, ErrorCode::SourceNotFound);
        assert_eq!(err.message, "Source not found");
        assert_eq!(err.hint, Some("Check the connector registry".to_string()));
        assert!(err.context.is_none());
    }

    #[test]
    fn test_display_implementation() {
        let err = SluiceError::new(ErrorCode::QueryCancelled, "Request 7.1 was cancelled")
            .with_hint("Resubmit");
        assert_eq!(
            err.to_string(),
            "[SLUICE-2001] Request 7.1 was cancelled (Hint: Resubmit)"
        );

        let err_no_hint = SluiceError::new(ErrorCode::InternalPanic, "Crash");
        assert_eq!(err_no_hint.to_string(), "[SLUICE-5001] Crash");
    }

    #[test]
    fn test_component_classification() {
        assert!(SluiceError::new(ErrorCode::SubmissionRejected, "full").is_component_error());
        assert!(SluiceError::internal("bad state").is_component_error());
        assert!(!SluiceError::cancelled("s1.1").is_component_error());
        assert!(!SluiceError::new(ErrorCode::SourceExecutionFailed, "boom").is_component_error());
    }

    #[test]
    fn test_source_not_found_hint() {
        let available = vec!["orders_db".to_string(), "warehouse".to_string()];
        let err = SluiceError::source_not_found("order_db", &available);
        assert_eq!(err.code, ErrorCode::SourceNotFound);
        assert_eq!(err.hint, Some("Did you mean 'orders_db'?".to_string()));

        let err = SluiceError::source_not_found("zzzzzzzzzz", &available);
        assert!(err.hint.is_none());
    }

    #[test]
    fn test_json_output() {
        let err = SluiceError::new(ErrorCode::DeliveryPending, "Delivery already pending");
        let json = err.to_json();

        assert!(json.contains("\"code\":\"SLUICE-2004\""));
        assert!(json.contains("\"message\":\"Delivery already pending\""));
    }
}
