use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sluice_common::models::RequestId;
use sluice_common::types::{ColumnSchema, Row};
use sluice_error::{Result, SluiceError};

/// What a plan asks a connector for: a table and the column types it expects back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCommand {
    pub connector: String,
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

impl SourceCommand {
    pub fn new(
        connector: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<ColumnSchema>,
    ) -> Self {
        Self {
            connector: connector.into(),
            table: table.into(),
            columns,
        }
    }
}

/// Per-call information handed to a connector when an execution is created.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    pub source_request_id: u32,
    /// The call participates in a transaction.
    pub transactional: bool,
    /// Failures of this call may be downgraded to warnings.
    pub partial_results: bool,
}

/// Outcome of one `execute`/`more` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceResponse {
    Rows { rows: Vec<Row>, last: bool },
    /// No data yet; ask again after the delay.
    NotAvailable(Duration),
}

/// One outstanding downstream call.
///
/// `execute` and `more` may be awaited on a runtime worker while `cancel` or
/// `close` are invoked from another thread, so implementations use interior
/// mutability.
#[async_trait]
pub trait SourceExecution: Send + Sync {
    async fn execute(&self) -> Result<SourceResponse>;

    async fn more(&self) -> Result<SourceResponse>;

    /// Requests that an in-progress call stop. Must not block.
    fn cancel(&self);

    /// Releases the downstream resources. Called at most once.
    fn close(&self);
}

pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    fn create_execution(
        &self,
        command: &SourceCommand,
        context: &ExecutionContext,
    ) -> Result<Arc<dyn SourceExecution>>;
}

/// Connectors available to the engine, by name.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connector: Arc<dyn Connector>) {
        let name = connector.name().to_string();
        tracing::debug!(target: "connector", connector = %name, "Registered connector");
        self.connectors.write().insert(name, connector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>> {
        let connectors = self.connectors.read();
        match connectors.get(name) {
            Some(connector) => Ok(connector.clone()),
            None => {
                let mut available: Vec<String> = connectors.keys().cloned().collect();
                available.sort();
                Err(SluiceError::source_not_found(name, &available))
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::memory::MemoryConnector;
    use sluice_error::ErrorCode;

    #[test]
    fn test_registry_lookup_suggests_closest_name() {
        let registry = ConnectorRegistry::new();
        registry.register(Arc::new(MemoryConnector::new("warehouse")));
        registry.register(Arc::new(MemoryConnector::new("crm")));

        assert_eq!(registry.names(), vec!["crm", "warehouse"]);
        assert!(registry.get("crm").is_ok());

        let err = registry.get("warehous").err().unwrap();
        assert_eq!(err.code, ErrorCode::SourceNotFound);
        assert!(err.hint.unwrap_or_default().contains("warehouse"));
    }
}
