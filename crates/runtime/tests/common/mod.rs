#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sluice_common::config::AppConfig;
use sluice_common::models::{Determinism, SessionInfo};
use sluice_common::types::{ColumnSchema, DataType, Row, Value};
use sluice_connectors::sources::{MemoryConnector, MemoryTable};
use sluice_connectors::{ConnectorRegistry, SourceCommand};
use sluice_runtime::plan::{ScanPlanFactory, StaticPlanCompiler};
use sluice_runtime::transaction::LocalTransactionService;
use sluice_runtime::{Engine, EngineOptions};

pub const CONNECTOR: &str = "mem";

pub struct Harness {
    pub engine: Engine,
    pub connector: Arc<MemoryConnector>,
    pub compiler: Arc<StaticPlanCompiler>,
    pub transactions: Arc<LocalTransactionService>,
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.max_workers = 4;
    config
}

pub fn int_columns() -> Vec<ColumnSchema> {
    vec![ColumnSchema::new("v", DataType::Integer)]
}

/// Rows `first..=last` of a single integer column.
pub fn int_rows(first: i64, last: i64) -> Vec<Row> {
    (first..=last).map(|v| vec![Value::Integer(v)]).collect()
}

pub fn session(id: &str) -> SessionInfo {
    SessionInfo::new(id, "alice", "sales", 1)
}

pub fn scan_sql(table: &str) -> String {
    format!("SELECT * FROM {}", table)
}

impl Harness {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let connector = Arc::new(MemoryConnector::new(CONNECTOR));
        let connectors = Arc::new(ConnectorRegistry::new());
        connectors.register(connector.clone());
        let compiler = Arc::new(StaticPlanCompiler::new());
        let transactions = Arc::new(LocalTransactionService::new());

        let engine = Engine::new(EngineOptions {
            config,
            connectors,
            compiler: compiler.clone(),
            transactions: transactions.clone(),
            lob_store: None,
        })?;
        Ok(Self {
            engine,
            connector,
            compiler,
            transactions,
        })
    }

    /// Adds `table` and registers `SELECT * FROM <name>` as a scan of it.
    pub fn table(&self, name: &str, table: MemoryTable, determinism: Determinism, read_only: bool) {
        let columns = table.columns().to_vec();
        self.connector.add_table(name, table);
        self.scan(&scan_sql(name), &[(name, columns)], determinism, read_only);
    }

    /// Registers `sql` as a scan over existing tables, in order.
    pub fn scan(
        &self,
        sql: &str,
        tables: &[(&str, Vec<ColumnSchema>)],
        determinism: Determinism,
        read_only: bool,
    ) {
        let commands = tables
            .iter()
            .map(|(table, columns)| SourceCommand::new(CONNECTOR, *table, columns.clone()))
            .collect();
        let mut plan = ScanPlanFactory::new(commands).prepare(determinism);
        plan.read_only = read_only;
        self.compiler.register(sql, plan);
    }

    /// The transaction started first, by id.
    pub fn first_transaction(&self) -> Option<String> {
        self.transactions
            .events()
            .first()
            .map(|event| event.transaction_id.clone())
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
