//! # Error Contexts
//!
//! Structured metadata attached to errors for programmatic handling.

use serde::{Deserialize, Serialize};

/// Structured context for errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// The request an error belongs to
    Request {
        session_id: String,
        execution_id: u64,
    },

    /// A downstream call that failed (SLUICE-1xxx)
    Source {
        connector: String,
        source_request_id: u32,
    },

    /// A rejected result window (SLUICE-2005)
    Window { begin_row: u64, end_row: u64 },

    /// A failed transaction operation (SLUICE-4003)
    Transaction {
        transaction_id: String,
        operation: String,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_context_serde_roundtrip() {
        let ctx = ErrorContext::Source {
            connector: "orders".to_string(),
            source_request_id: 3,
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"type\":\"source\""));
        let de: ErrorContext = serde_json::from_str(&json).unwrap();
        assert_eq!(de, ctx);
    }
}
