//! # Query Warnings
//!
//! Non-fatal conditions collected while a request runs (for example a
//! downstream failure tolerated under partial results) and returned to the
//! consumer alongside the next delivered window.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_error::{ErrorCode, SluiceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryWarning {
    /// Connector or component that raised the warning.
    pub source: Option<String>,
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl QueryWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            source: None,
            message: message.into(),
            code: None,
        }
    }

    /// A downstream failure downgraded to a warning.
    pub fn from_source_error(source: impl Into<String>, error: &SluiceError) -> Self {
        Self {
            source: Some(source.into()),
            message: error.message.clone(),
            code: Some(error.code),
        }
    }
}

/// Shared, cheaply clonable warning list.
///
/// Connector completion callbacks push from other workers while the owning
/// request drains it; the lock is only held for the push or drain.
#[derive(Debug, Clone, Default)]
pub struct WarningCollector {
    inner: Arc<Mutex<Vec<QueryWarning>>>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, warning: QueryWarning) {
        tracing::debug!(target: "request", message = %warning.message, "Warning recorded");
        self.inner.lock().push(warning);
    }

    pub fn extend(&self, warnings: impl IntoIterator<Item = QueryWarning>) {
        self.inner.lock().extend(warnings);
    }

    /// Removes and returns every collected warning.
    pub fn drain(&self) -> Vec<QueryWarning> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_is_shared_between_clones() {
        let collector = WarningCollector::new();
        let clone = collector.clone();
        clone.add(QueryWarning::new("first"));
        collector.add(QueryWarning::new("second"));

        assert_eq!(collector.len(), 2);
        let drained = clone.drain();
        assert_eq!(drained[0].message, "first");
        assert!(collector.is_empty());
    }
}
