//! Sluice Runtime: the execution spine of the federated query engine.
//!
//! This crate schedules requests cooperatively over a fixed worker pool,
//! bounds how many plans run at once, drives each request through its
//! state machine and caches plans and results per session scope.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   admit    ┌────────────┐
//! │   Engine    │──────────▶│ Admission  │
//! └──────┬──────┘            └────────────┘
//!        │ submit
//! ┌──────▼──────┐   run      ┌────────────────┐   poll   ┌────────────┐
//! │  Scheduler  │──────────▶│ RequestWorkItem│────────▶│ Connectors │
//! └─────────────┘            └───────┬────────┘          └────────────┘
//!                                    │
//!                            ┌───────▼────────┐
//!                            │ Result / plan  │
//!                            │     caches     │
//!                            └────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sluice_common::config::AppConfig;
//! use sluice_common::models::{Determinism, SessionInfo};
//! use sluice_common::types::{ColumnSchema, DataType, Value};
//! use sluice_connectors::sources::{MemoryConnector, MemoryTable};
//! use sluice_connectors::{ConnectorRegistry, SourceCommand};
//! use sluice_runtime::plan::{ScanPlanFactory, StaticPlanCompiler};
//! use sluice_runtime::transaction::LocalTransactionService;
//! use sluice_runtime::{Engine, EngineOptions, QueryRequest};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let columns = vec![ColumnSchema::new("id", DataType::Integer)];
//! let rows = vec![vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]];
//!
//! let connectors = Arc::new(ConnectorRegistry::new());
//! connectors.register(Arc::new(
//!     MemoryConnector::new("crm").with_table("accounts", MemoryTable::new(columns.clone(), rows)),
//! ));
//! let compiler = Arc::new(StaticPlanCompiler::new());
//! compiler.register(
//!     "SELECT id FROM accounts",
//!     ScanPlanFactory::new(vec![SourceCommand::new("crm", "accounts", columns)])
//!         .prepare(Determinism::Deterministic),
//! );
//!
//! let engine = Engine::new(EngineOptions {
//!     config: AppConfig::default(),
//!     connectors,
//!     compiler,
//!     transactions: Arc::new(LocalTransactionService::new()),
//!     lob_store: None,
//! })?;
//!
//! let session = SessionInfo::new("s1", "alice", "sales", 1);
//! let page = engine
//!     .submit_request(session, 1, QueryRequest::new("SELECT id FROM accounts"))?
//!     .await?;
//! assert!(page.is_last);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod cache;
pub mod engine;
pub mod plan;
pub mod request;
pub mod scheduler;
pub mod snapshot;
pub mod transaction;

pub use engine::{Engine, EngineOptions};
pub use request::{QueryOptions, QueryRequest};
