//! Contract between a request and the plan it drives.
//!
//! Plans are external collaborators: the engine only needs them to produce
//! batches when driven, report a yield instead of blocking, and reach their
//! downstream sources through a [`PlanContext`] supplied by the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sluice_common::models::{Determinism, SessionInfo};
use sluice_common::types::{ColumnSchema, Row};
use sluice_common::warnings::QueryWarning;
use sluice_connectors::{SourceCommand, SourcePoll};
use sluice_error::{ErrorCode, Result, SluiceError};

use crate::cache::Cachable;

#[derive(Debug, Clone, PartialEq)]
pub struct TupleBatch {
    pub rows: Vec<Row>,
    pub last: bool,
}

/// Result of driving a plan once.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanPoll {
    Batch(TupleBatch),
    /// No data yet; not an error.
    Blocked,
    RetryAfter(Duration),
}

/// Access to downstream sources and request state, for the duration of one call.
pub trait PlanContext {
    /// Opens a downstream call and returns its source request id.
    fn open_source(&mut self, command: &SourceCommand) -> Result<u32>;

    fn poll_source(&mut self, source_request_id: u32) -> Result<SourcePoll>;

    /// Closes a call whose remaining rows are not needed.
    fn close_source(&mut self, source_request_id: u32);

    fn is_canceled(&self) -> bool;

    fn time_slice_expired(&self) -> bool;
}

pub trait PlanExecutor: Send {
    fn next_batch(&mut self, context: &mut dyn PlanContext) -> Result<PlanPoll>;

    fn cancel(&mut self);

    fn close(&mut self);

    fn take_warnings(&mut self) -> Vec<QueryWarning> {
        Vec::new()
    }
}

pub trait PlanFactory: Send + Sync {
    fn instantiate(&self) -> Result<Box<dyn PlanExecutor>>;
}

/// A compiled plan, reusable across requests.
#[derive(Clone)]
pub struct PreparedPlan {
    pub columns: Vec<ColumnSchema>,
    pub determinism: Determinism,
    pub read_only: bool,
    pub factory: Arc<dyn PlanFactory>,
}

impl Cachable for PreparedPlan {}

impl std::fmt::Debug for PreparedPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedPlan")
            .field("columns", &self.columns)
            .field("determinism", &self.determinism)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

pub trait PlanCompiler: Send + Sync {
    fn compile(&self, sql: &str, session: &SessionInfo) -> Result<PreparedPlan>;
}

/// Compiler over a fixed table of statements.
#[derive(Default)]
pub struct StaticPlanCompiler {
    plans: RwLock<HashMap<String, PreparedPlan>>,
}

impl StaticPlanCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sql: impl Into<String>, plan: PreparedPlan) {
        self.plans.write().insert(normalize_sql(&sql.into()), plan);
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl PlanCompiler for StaticPlanCompiler {
    fn compile(&self, sql: &str, _session: &SessionInfo) -> Result<PreparedPlan> {
        self.plans
            .read()
            .get(&normalize_sql(sql))
            .cloned()
            .ok_or_else(|| {
                SluiceError::new(
                    ErrorCode::PlanCompilation,
                    format!("No plan registered for statement: {}", sql),
                )
            })
    }
}

/// Reads every command to exhaustion, in order.
pub struct ScanPlanFactory {
    commands: Vec<SourceCommand>,
    limit: Option<usize>,
}

impl ScanPlanFactory {
    pub fn new(commands: Vec<SourceCommand>) -> Self {
        Self {
            commands,
            limit: None,
        }
    }

    /// Stops after `limit` rows and closes the remaining source early.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Wraps the scan into a prepared plan.
    pub fn prepare(self, determinism: Determinism) -> PreparedPlan {
        let columns = self
            .commands
            .first()
            .map(|c| c.columns.clone())
            .unwrap_or_default();
        PreparedPlan {
            columns,
            determinism,
            read_only: true,
            factory: Arc::new(self),
        }
    }
}

impl PlanFactory for ScanPlanFactory {
    fn instantiate(&self) -> Result<Box<dyn PlanExecutor>> {
        Ok(Box::new(ScanPlan {
            commands: self.commands.clone(),
            limit: self.limit,
            index: 0,
            current: None,
            produced: 0,
            canceled: false,
        }))
    }
}

pub struct ScanPlan {
    commands: Vec<SourceCommand>,
    limit: Option<usize>,
    index: usize,
    current: Option<u32>,
    produced: usize,
    canceled: bool,
}

impl ScanPlan {
    fn finished() -> PlanPoll {
        PlanPoll::Batch(TupleBatch {
            rows: Vec::new(),
            last: true,
        })
    }
}

impl PlanExecutor for ScanPlan {
    fn next_batch(&mut self, context: &mut dyn PlanContext) -> Result<PlanPoll> {
        loop {
            if self.canceled || context.is_canceled() {
                return Err(SluiceError::new(ErrorCode::QueryCancelled, "Scan cancelled"));
            }
            let Some(command) = self.commands.get(self.index) else {
                return Ok(Self::finished());
            };
            let source = match self.current {
                Some(source) => source,
                None => {
                    let source = context.open_source(command)?;
                    self.current = Some(source);
                    source
                }
            };

            let batch = match context.poll_source(source)? {
                SourcePoll::Pending => return Ok(PlanPoll::Blocked),
                SourcePoll::RetryAfter(delay) => return Ok(PlanPoll::RetryAfter(delay)),
                SourcePoll::Batch(batch) => batch,
            };

            let mut rows = batch.rows;
            let mut limit_reached = false;
            if let Some(limit) = self.limit {
                let remaining = limit.saturating_sub(self.produced);
                if rows.len() >= remaining {
                    rows.truncate(remaining);
                    limit_reached = true;
                }
            }
            self.produced += rows.len();

            if limit_reached {
                if !batch.last {
                    context.close_source(source);
                }
                self.index = self.commands.len();
                self.current = None;
                return Ok(PlanPoll::Batch(TupleBatch { rows, last: true }));
            }

            if batch.last {
                self.index += 1;
                self.current = None;
            }
            let last = self.index >= self.commands.len();
            if !rows.is_empty() || last {
                return Ok(PlanPoll::Batch(TupleBatch { rows, last }));
            }
        }
    }

    fn cancel(&mut self) {
        self.canceled = true;
    }

    fn close(&mut self) {
        self.current = None;
        self.index = self.commands.len();
    }
}
