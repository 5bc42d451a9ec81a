//! Sluice Runtime Entry Point.
//!
//! Runs a paginated query against an in-memory connector. It handles:
//! - Configuration loading
//! - Tracing initialization
//! - Engine setup on the `tokio` runtime
//! - Paging through results and shutting down
use std::sync::Arc;
use std::time::Duration;

use sluice_common::config::AppConfig;
use sluice_common::models::{Determinism, RequestId, SessionInfo};
use sluice_common::types::{ColumnSchema, DataType, Value};
use sluice_connectors::sources::{MemoryConnector, MemoryTable};
use sluice_connectors::{ConnectorRegistry, SourceCommand};
use sluice_runtime::plan::{ScanPlanFactory, StaticPlanCompiler};
use sluice_runtime::transaction::LocalTransactionService;
use sluice_runtime::{Engine, EngineOptions, QueryOptions, QueryRequest};

const DEMO_SQL: &str = "SELECT id, name FROM customers";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_file("config/sluice.yaml").unwrap_or_default();
    sluice_common::telemetry::init_tracing(&config.telemetry)?;

    let columns = vec![
        ColumnSchema::new("id", DataType::Integer),
        ColumnSchema::new("name", DataType::String),
    ];
    let batches = (0..4)
        .map(|batch| {
            (0..25)
                .map(|i| {
                    let id = batch * 25 + i + 1;
                    vec![Value::Integer(id), Value::String(format!("customer-{}", id))]
                })
                .collect()
        })
        .collect();

    let connectors = Arc::new(ConnectorRegistry::new());
    connectors.register(Arc::new(
        MemoryConnector::new("crm").with_table("customers", MemoryTable::new(columns.clone(), batches)),
    ));

    let compiler = Arc::new(StaticPlanCompiler::new());
    compiler.register(
        DEMO_SQL,
        ScanPlanFactory::new(vec![SourceCommand::new("crm", "customers", columns)])
            .prepare(Determinism::Deterministic),
    );

    let shutdown_timeout = Duration::from_millis(config.engine.shutdown_timeout_ms);
    let engine = Engine::new(EngineOptions {
        config,
        connectors,
        compiler,
        transactions: Arc::new(LocalTransactionService::new()),
        lob_store: None,
    })?;

    let session = SessionInfo::new("demo", "admin", "sales", 1);
    let id = RequestId::new("demo", 1);
    let request = QueryRequest::new(DEMO_SQL).with_options(QueryOptions {
        fetch_size: Some(40),
        ..Default::default()
    });

    let mut page = engine.submit_request(session, 1, request)?.await?;
    loop {
        tracing::info!(
            first_row = page.first_row,
            last_row = page.last_row,
            is_last = page.is_last,
            "Received page"
        );
        if page.is_last {
            break;
        }
        let begin = page.last_row + 1;
        page = engine.request_more(&id, begin, begin + 39)?.await?;
    }

    engine.close_request(&id)?;
    println!("{}", engine.snapshot().to_json()?);

    if !engine.shutdown(shutdown_timeout).await {
        tracing::warn!("Engine did not drain before the shutdown timeout");
    }
    Ok(())
}
