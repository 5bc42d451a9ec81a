//! In-memory connector.
//!
//! Serves named tables as fixed row batches. Each table can script the
//! downstream behaviors the engine must cope with: not-available delays,
//! a failing poll, a poll that hangs until cancelled, and a first call that
//! waits for an external signal. Every call is recorded with its timestamp.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sluice_common::lob::{LobError, LobSource};
use sluice_common::types::{ColumnSchema, Row};
use sluice_error::{closest_match, ErrorCode, Result, SluiceError};
use tokio::sync::Notify;

use crate::connector::{
    Connector, ExecutionContext, SourceCommand, SourceExecution, SourceResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Execute,
    More,
    Cancel,
    Close,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub table: String,
    pub source_request_id: u32,
    pub kind: CallKind,
    pub at: Instant,
}

#[derive(Clone, Default)]
pub struct MemoryTable {
    columns: Vec<ColumnSchema>,
    batches: Vec<Vec<Row>>,
    delays: Vec<Duration>,
    fail_on_poll: Option<usize>,
    hang_on_poll: Option<usize>,
    hold: Option<Arc<Notify>>,
}

impl MemoryTable {
    pub fn new(columns: Vec<ColumnSchema>, batches: Vec<Vec<Row>>) -> Self {
        Self {
            columns,
            batches,
            ..Default::default()
        }
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// The next `execute` answers "not available" with `delay`.
    pub fn not_available_once(mut self, delay: Duration) -> Self {
        self.delays.push(delay);
        self
    }

    /// Poll number `poll` (1-based, counting `execute` and `more`) fails.
    pub fn fail_on_poll(mut self, poll: usize) -> Self {
        self.fail_on_poll = Some(poll);
        self
    }

    /// Poll number `poll` never returns data; it ends only when cancelled.
    pub fn hang_on_poll(mut self, poll: usize) -> Self {
        self.hang_on_poll = Some(poll);
        self
    }

    /// The first poll of every execution waits for a permit on `signal`.
    pub fn hold_until(mut self, signal: Arc<Notify>) -> Self {
        self.hold = Some(signal);
        self
    }
}

pub struct MemoryConnector {
    name: String,
    tables: RwLock<HashMap<String, Arc<MemoryTable>>>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl MemoryConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_table(self, name: impl Into<String>, table: MemoryTable) -> Self {
        self.add_table(name, table);
        self
    }

    pub fn add_table(&self, name: impl Into<String>, table: MemoryTable) {
        self.tables.write().insert(name.into(), Arc::new(table));
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }
}

impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_execution(
        &self,
        command: &SourceCommand,
        context: &ExecutionContext,
    ) -> Result<Arc<dyn SourceExecution>> {
        let tables = self.tables.read();
        let table = match tables.get(&command.table) {
            Some(table) => table.clone(),
            None => {
                let available: Vec<String> = tables.keys().cloned().collect();
                let mut err = SluiceError::new(
                    ErrorCode::SourceNotFound,
                    format!(
                        "Table '{}' not found in connector '{}'",
                        command.table, self.name
                    ),
                );
                if let Some(closest) = closest_match(&command.table, &available) {
                    err = err.with_hint(format!("Did you mean '{}'?", closest));
                }
                return Err(err);
            }
        };

        Ok(Arc::new(MemoryExecution {
            table_name: command.table.clone(),
            source_request_id: context.source_request_id,
            delays: Mutex::new(table.delays.iter().copied().collect::<VecDeque<_>>()),
            table,
            calls: self.calls.clone(),
            polls: AtomicUsize::new(0),
            next_batch: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
        }))
    }
}

struct MemoryExecution {
    table_name: String,
    source_request_id: u32,
    table: Arc<MemoryTable>,
    delays: Mutex<VecDeque<Duration>>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    polls: AtomicUsize,
    next_batch: AtomicUsize,
    canceled: AtomicBool,
    cancel_signal: Notify,
}

impl MemoryExecution {
    fn record(&self, kind: CallKind) {
        self.calls.lock().push(CallRecord {
            table: self.table_name.clone(),
            source_request_id: self.source_request_id,
            kind,
            at: Instant::now(),
        });
    }

    fn cancelled_error(&self) -> SluiceError {
        SluiceError::new(
            ErrorCode::QueryCancelled,
            format!("Read of table '{}' was cancelled", self.table_name),
        )
    }

    async fn wait_for_cancel(&self) {
        loop {
            let notified = self.cancel_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.canceled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn serve(&self, poll: usize) -> Result<SourceResponse> {
        if poll == 1 {
            if let Some(hold) = &self.table.hold {
                hold.notified().await;
            }
        }
        if self.table.hang_on_poll == Some(poll) {
            self.wait_for_cancel().await;
            return Err(self.cancelled_error());
        }
        if self.canceled.load(Ordering::SeqCst) {
            return Err(self.cancelled_error());
        }
        if self.table.fail_on_poll == Some(poll) {
            return Err(SluiceError::new(
                ErrorCode::SourceExecutionFailed,
                format!(
                    "Simulated failure reading '{}' on poll {}",
                    self.table_name, poll
                ),
            ));
        }

        let batches = &self.table.batches;
        let index = self.next_batch.fetch_add(1, Ordering::SeqCst);
        let rows = batches.get(index).cloned().unwrap_or_default();
        Ok(SourceResponse::Rows {
            rows,
            last: index + 1 >= batches.len(),
        })
    }
}

#[async_trait]
impl SourceExecution for MemoryExecution {
    async fn execute(&self) -> Result<SourceResponse> {
        self.record(CallKind::Execute);
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delays.lock().pop_front() {
            return Ok(SourceResponse::NotAvailable(delay));
        }
        self.next_batch.store(0, Ordering::SeqCst);
        self.serve(poll).await
    }

    async fn more(&self) -> Result<SourceResponse> {
        self.record(CallKind::More);
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        self.serve(poll).await
    }

    fn cancel(&self) {
        self.record(CallKind::Cancel);
        self.canceled.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_waiters();
    }

    fn close(&self) {
        self.record(CallKind::Close);
    }
}

/// A connector-owned LOB backed by a byte vector.
pub struct MemoryLobSource {
    bytes: Vec<u8>,
    spill: bool,
}

impl MemoryLobSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            spill: false,
        }
    }

    /// Marks the source as valid only while its call is open.
    pub fn spill_required(mut self) -> Self {
        self.spill = true;
        self
    }
}

impl LobSource for MemoryLobSource {
    fn length(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }

    fn read(&self, offset: u64, len: usize) -> std::result::Result<Vec<u8>, LobError> {
        let start = usize::try_from(offset)
            .map_err(|_| LobError::Source(format!("offset {} out of range", offset)))?
            .min(self.bytes.len());
        let end = start.saturating_add(len).min(self.bytes.len());
        Ok(self.bytes[start..end].to_vec())
    }

    fn requires_spill(&self) -> bool {
        self.spill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::models::RequestId;
    use sluice_common::types::{DataType, Value};

    fn context() -> ExecutionContext {
        ExecutionContext {
            request_id: RequestId::new("s", 1),
            source_request_id: 3,
            transactional: false,
            partial_results: false,
        }
    }

    #[tokio::test]
    async fn test_batches_and_call_log() {
        let columns = vec![ColumnSchema::new("v", DataType::Integer)];
        let connector = MemoryConnector::new("mem").with_table(
            "t",
            MemoryTable::new(
                columns.clone(),
                vec![vec![vec![Value::Integer(1)]], vec![vec![Value::Integer(2)]]],
            ),
        );
        let execution = connector
            .create_execution(&SourceCommand::new("mem", "t", columns), &context())
            .unwrap();

        let first = execution.execute().await.unwrap();
        assert_eq!(
            first,
            SourceResponse::Rows {
                rows: vec![vec![Value::Integer(1)]],
                last: false
            }
        );
        let second = execution.more().await.unwrap();
        assert!(matches!(second, SourceResponse::Rows { last: true, .. }));
        execution.close();

        let calls = connector.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.source_request_id == 3 && c.table == "t"));
        assert!(calls[0].at <= calls[2].at);
    }

    #[tokio::test]
    async fn test_unknown_table_suggests_name() {
        let connector = MemoryConnector::new("mem")
            .with_table("orders", MemoryTable::new(vec![], vec![]));
        let err = connector
            .create_execution(&SourceCommand::new("mem", "order", vec![]), &context())
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::SourceNotFound);
        assert_eq!(err.hint.as_deref(), Some("Did you mean 'orders'?"));
    }

    #[tokio::test]
    async fn test_empty_table_is_single_final_batch() {
        let connector =
            MemoryConnector::new("mem").with_table("empty", MemoryTable::new(vec![], vec![]));
        let execution = connector
            .create_execution(&SourceCommand::new("mem", "empty", vec![]), &context())
            .unwrap();
        assert_eq!(
            execution.execute().await.unwrap(),
            SourceResponse::Rows {
                rows: vec![],
                last: true
            }
        );
    }
}
