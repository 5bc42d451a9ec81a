//! Non-blocking adapter over one downstream call.
//!
//! The owning request is driven by synchronous work-item generations, while
//! connectors are async. Each `execute`/`more` call is spawned onto the
//! runtime; its result comes back over a oneshot channel and the completion
//! task invokes the request's waker. `poll()` never blocks: it either hands
//! back a converted batch, reports that a call is still pending, or relays a
//! retry delay.
//!
//! Close semantics differ by call kind. A non-transactional call whose poll is
//! in flight is closed by the completion task once the poll returns. A
//! transactional call is always closed immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_common::lob::LobStore;
use sluice_common::types::{ColumnSchema, Row};
use sluice_common::warnings::{QueryWarning, WarningCollector};
use sluice_error::{ErrorContext, Result, SluiceError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::connector::{ExecutionContext, SourceExecution, SourceResponse};
use crate::conversion::RowConverter;

/// Callback that schedules the owning request for another run.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub rows: Vec<Row>,
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Batch(SourceBatch),
    /// A call is in flight; the waker fires when it completes.
    Pending,
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// Closed by the completion task once the in-flight poll returns.
    Deferred,
}

/// Observable state of a downstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Waiting out a not-available delay.
    Queued,
    Running,
    Idle,
}

/// Flags shared with the completion task and read by snapshots.
struct CallFlags {
    in_flight: AtomicBool,
    waiting_retry: AtomicBool,
    executed: AtomicBool,
    done: AtomicBool,
    canceled: AtomicBool,
    close_requested: AtomicBool,
    closed: AtomicBool,
    rows_processed: AtomicU64,
}

struct PollState {
    pending: Option<oneshot::Receiver<Result<SourceResponse>>>,
    retry_at: Option<Instant>,
    converter: RowConverter,
    explicit_close: bool,
}

pub struct ConnectorPollAdapter {
    connector: String,
    table: String,
    context: ExecutionContext,
    execution: Arc<dyn SourceExecution>,
    handle: Handle,
    waker: Waker,
    warnings: WarningCollector,
    flags: Arc<CallFlags>,
    state: Mutex<PollState>,
}

impl ConnectorPollAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: impl Into<String>,
        table: impl Into<String>,
        columns: &[ColumnSchema],
        context: ExecutionContext,
        execution: Arc<dyn SourceExecution>,
        lob_store: Arc<dyn LobStore>,
        handle: Handle,
        waker: Waker,
        warnings: WarningCollector,
    ) -> Self {
        Self {
            connector: connector.into(),
            table: table.into(),
            context,
            execution,
            handle,
            waker,
            warnings,
            flags: Arc::new(CallFlags {
                in_flight: AtomicBool::new(false),
                waiting_retry: AtomicBool::new(false),
                executed: AtomicBool::new(false),
                done: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                rows_processed: AtomicU64::new(0),
            }),
            state: Mutex::new(PollState {
                pending: None,
                retry_at: None,
                converter: RowConverter::new(columns, lob_store),
                explicit_close: false,
            }),
        }
    }

    pub fn source_request_id(&self) -> u32 {
        self.context.source_request_id
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_transactional(&self) -> bool {
        self.context.transactional
    }

    pub fn poll(&self) -> Result<SourcePoll> {
        if self.flags.canceled.load(Ordering::SeqCst) {
            return Err(SluiceError::cancelled(&self.context.request_id));
        }
        if self.flags.closed.load(Ordering::SeqCst) && !self.flags.done.load(Ordering::SeqCst) {
            return Err(SluiceError::internal(format!(
                "Source request {} polled after close",
                self.context.source_request_id
            )));
        }

        let mut state = self.state.lock();
        if self.flags.done.load(Ordering::SeqCst) {
            return Ok(SourcePoll::Batch(SourceBatch {
                rows: Vec::new(),
                last: true,
            }));
        }

        if let Some(receiver) = state.pending.as_mut() {
            return match receiver.try_recv() {
                Ok(response) => {
                    state.pending = None;
                    self.handle_response(&mut state, response)
                }
                Err(oneshot::error::TryRecvError::Empty) => Ok(SourcePoll::Pending),
                Err(oneshot::error::TryRecvError::Closed) => {
                    state.pending = None;
                    Err(SluiceError::internal(format!(
                        "Poll task for source request {} ended without a result",
                        self.context.source_request_id
                    )))
                }
            };
        }

        if let Some(retry_at) = state.retry_at {
            let now = Instant::now();
            if now < retry_at {
                return Ok(SourcePoll::RetryAfter(retry_at - now));
            }
            state.retry_at = None;
            self.flags.waiting_retry.store(false, Ordering::SeqCst);
        }

        state.pending = Some(self.spawn_call());
        Ok(SourcePoll::Pending)
    }

    fn spawn_call(&self) -> oneshot::Receiver<Result<SourceResponse>> {
        let (sender, receiver) = oneshot::channel();
        let first = !self.flags.executed.load(Ordering::SeqCst);
        let execution = self.execution.clone();
        let flags = self.flags.clone();
        let waker = self.waker.clone();
        let transactional = self.context.transactional;
        let source_request_id = self.context.source_request_id;

        trace!(
            target: "connector",
            connector = %self.connector,
            source_request_id,
            call = if first { "execute" } else { "more" },
            "Issuing downstream call"
        );

        flags.in_flight.store(true, Ordering::SeqCst);
        self.handle.spawn(async move {
            let response = if first {
                execution.execute().await
            } else {
                execution.more().await
            };
            // Receiver is gone when the request already closed
            let _ = sender.send(response);
            flags.in_flight.store(false, Ordering::SeqCst);

            if flags.close_requested.load(Ordering::SeqCst)
                && !transactional
                && !flags.closed.swap(true, Ordering::SeqCst)
            {
                debug!(target: "connector", source_request_id, "Deferred close after in-flight poll");
                execution.close();
            }
            waker();
        });
        receiver
    }

    fn handle_response(
        &self,
        state: &mut PollState,
        response: Result<SourceResponse>,
    ) -> Result<SourcePoll> {
        match response {
            Ok(SourceResponse::NotAvailable(delay)) => {
                debug!(
                    target: "connector",
                    connector = %self.connector,
                    source_request_id = self.context.source_request_id,
                    delay_ms = delay.as_millis() as u64,
                    "Data not available, retry later"
                );
                state.retry_at = Some(Instant::now() + delay);
                self.flags.waiting_retry.store(true, Ordering::SeqCst);
                Ok(SourcePoll::RetryAfter(delay))
            }
            Ok(SourceResponse::Rows { rows, last }) => {
                self.flags.executed.store(true, Ordering::SeqCst);
                let batch = match state.converter.convert(rows) {
                    Ok(batch) => batch,
                    Err(e) => return self.handle_failure(e),
                };
                if batch.has_streamed_lobs && !state.explicit_close {
                    debug!(
                        target: "connector",
                        source_request_id = self.context.source_request_id,
                        "Batch holds connector streams, explicit close required"
                    );
                    state.explicit_close = true;
                }
                self.flags
                    .rows_processed
                    .fetch_add(batch.rows.len() as u64, Ordering::SeqCst);
                if last {
                    self.flags.done.store(true, Ordering::SeqCst);
                    if !state.explicit_close && !self.context.transactional {
                        self.close_execution();
                    }
                }
                Ok(SourcePoll::Batch(SourceBatch {
                    rows: batch.rows,
                    last,
                }))
            }
            Err(e) => self.handle_failure(e),
        }
    }

    fn handle_failure(&self, error: SluiceError) -> Result<SourcePoll> {
        let error = error.with_context(ErrorContext::Source {
            connector: self.connector.clone(),
            source_request_id: self.context.source_request_id,
        });
        if self.context.partial_results && !self.flags.canceled.load(Ordering::SeqCst) {
            info!(
                target: "connector",
                connector = %self.connector,
                source_request_id = self.context.source_request_id,
                error = %error,
                "Downstream failure downgraded to warning"
            );
            self.warnings
                .add(QueryWarning::from_source_error(self.connector.clone(), &error));
            self.flags.done.store(true, Ordering::SeqCst);
            if !self.context.transactional {
                self.close_execution();
            }
            return Ok(SourcePoll::Batch(SourceBatch {
                rows: Vec::new(),
                last: true,
            }));
        }
        Err(error)
    }

    /// Cancels the downstream call. Safe from any thread.
    pub fn cancel(&self) {
        if self.flags.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.flags.closed.load(Ordering::SeqCst) || self.flags.in_flight.load(Ordering::SeqCst) {
            debug!(
                target: "connector",
                connector = %self.connector,
                source_request_id = self.context.source_request_id,
                "Cancelling downstream call"
            );
            self.execution.cancel();
        }
    }

    /// Full close. Idempotent.
    pub fn close(&self) -> CloseOutcome {
        self.flags.close_requested.store(true, Ordering::SeqCst);
        if !self.context.transactional && self.flags.in_flight.load(Ordering::SeqCst) {
            return CloseOutcome::Deferred;
        }
        self.close_execution();
        CloseOutcome::Closed
    }

    fn close_execution(&self) {
        if !self.flags.closed.swap(true, Ordering::SeqCst) {
            trace!(
                target: "connector",
                source_request_id = self.context.source_request_id,
                rows = self.flags.rows_processed.load(Ordering::SeqCst),
                "Closing downstream call"
            );
            self.execution.close();
        }
    }

    /// The call still holds downstream resources or has a poll running.
    pub fn is_outstanding(&self) -> bool {
        !self.flags.closed.load(Ordering::SeqCst) || self.flags.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self) -> bool {
        self.flags.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.flags.done.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.canceled.load(Ordering::SeqCst)
    }

    pub fn rows_processed(&self) -> u64 {
        self.flags.rows_processed.load(Ordering::SeqCst)
    }

    pub fn call_state(&self) -> CallState {
        if self.flags.in_flight.load(Ordering::SeqCst) {
            CallState::Running
        } else if self.flags.waiting_retry.load(Ordering::SeqCst) {
            CallState::Queued
        } else {
            CallState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, SourceCommand};
    use crate::sources::memory::{CallKind, MemoryConnector, MemoryTable};
    use sluice_common::lob::MemoryLobStore;
    use sluice_common::models::RequestId;
    use sluice_common::types::{DataType, Value};
    use sluice_error::ErrorCode;
    use tokio::sync::Notify;

    fn columns() -> Vec<ColumnSchema> {
        vec![ColumnSchema::new("id", DataType::Integer)]
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range.map(|i| vec![Value::Integer(i)]).collect()
    }

    fn adapter(
        connector: &MemoryConnector,
        transactional: bool,
        partial_results: bool,
    ) -> (ConnectorPollAdapter, Arc<Notify>, WarningCollector) {
        let context = ExecutionContext {
            request_id: RequestId::new("s1", 1),
            source_request_id: 0,
            transactional,
            partial_results,
        };
        let command = SourceCommand::new("mem", "t", columns());
        let execution = connector.create_execution(&command, &context).unwrap();
        let notify = Arc::new(Notify::new());
        let wake = notify.clone();
        let warnings = WarningCollector::new();
        let adapter = ConnectorPollAdapter::new(
            "mem",
            "t",
            &columns(),
            context,
            execution,
            Arc::new(MemoryLobStore::new()),
            Handle::current(),
            Arc::new(move || wake.notify_one()),
            warnings.clone(),
        );
        (adapter, notify, warnings)
    }

    async fn poll_ready(adapter: &ConnectorPollAdapter, notify: &Notify) -> Result<SourcePoll> {
        loop {
            match adapter.poll()? {
                SourcePoll::Pending => notify.notified().await,
                other => return Ok(other),
            }
        }
    }

    #[tokio::test]
    async fn test_execute_then_more_with_implicit_close() {
        let connector = MemoryConnector::new("mem")
            .with_table("t", MemoryTable::new(columns(), vec![rows(0..2), rows(2..3)]));
        let (adapter, notify, _) = adapter(&connector, false, false);

        let first = poll_ready(&adapter, &notify).await.unwrap();
        assert_eq!(
            first,
            SourcePoll::Batch(SourceBatch {
                rows: rows(0..2),
                last: false
            })
        );
        let second = poll_ready(&adapter, &notify).await.unwrap();
        assert_eq!(
            second,
            SourcePoll::Batch(SourceBatch {
                rows: rows(2..3),
                last: true
            })
        );

        assert!(adapter.is_done());
        assert!(adapter.is_closed());
        assert_eq!(adapter.rows_processed(), 3);
        let kinds: Vec<CallKind> = connector.calls().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::Execute, CallKind::More, CallKind::Close]);
    }

    #[tokio::test]
    async fn test_not_available_is_remembered() {
        let table = MemoryTable::new(columns(), vec![rows(0..1)])
            .not_available_once(Duration::from_millis(200));
        let connector = MemoryConnector::new("mem").with_table("t", table);
        let (adapter, notify, _) = adapter(&connector, false, false);

        let poll = poll_ready(&adapter, &notify).await.unwrap();
        assert_eq!(poll, SourcePoll::RetryAfter(Duration::from_millis(200)));
        assert_eq!(adapter.call_state(), CallState::Queued);

        // Polling again early does not reach the connector
        match adapter.poll().unwrap() {
            SourcePoll::RetryAfter(remaining) => assert!(remaining <= Duration::from_millis(200)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(connector.calls_of(CallKind::Execute), 1);
    }

    #[tokio::test]
    async fn test_failure_without_partial_results_propagates() {
        let table = MemoryTable::new(columns(), vec![rows(0..1), rows(1..2)]).fail_on_poll(2);
        let connector = MemoryConnector::new("mem").with_table("t", table);
        let (adapter, notify, warnings) = adapter(&connector, false, false);

        poll_ready(&adapter, &notify).await.unwrap();
        let err = poll_ready(&adapter, &notify).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SourceExecutionFailed);
        assert!(matches!(err.context, Some(ErrorContext::Source { .. })));
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_failure_with_partial_results_becomes_warning() {
        let table = MemoryTable::new(columns(), vec![rows(0..1), rows(1..2)]).fail_on_poll(2);
        let connector = MemoryConnector::new("mem").with_table("t", table);
        let (adapter, notify, warnings) = adapter(&connector, false, true);

        poll_ready(&adapter, &notify).await.unwrap();
        let last = poll_ready(&adapter, &notify).await.unwrap();
        assert_eq!(
            last,
            SourcePoll::Batch(SourceBatch {
                rows: vec![],
                last: true
            })
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings.drain()[0].source.as_deref(), Some("mem"));
    }

    #[tokio::test]
    async fn test_non_transactional_close_is_deferred_while_in_flight() {
        let table = MemoryTable::new(columns(), vec![rows(0..1)]).hang_on_poll(1);
        let connector = MemoryConnector::new("mem").with_table("t", table);
        let (adapter, notify, _) = adapter(&connector, false, false);

        assert_eq!(adapter.poll().unwrap(), SourcePoll::Pending);
        assert_eq!(adapter.close(), CloseOutcome::Deferred);
        assert!(adapter.is_outstanding());

        adapter.cancel();
        notify.notified().await;
        assert!(adapter.is_closed());
        assert!(!adapter.is_outstanding());
        assert_eq!(connector.calls_of(CallKind::Cancel), 1);
        assert_eq!(connector.calls_of(CallKind::Close), 1);
    }

    #[tokio::test]
    async fn test_transactional_close_is_immediate() {
        let table = MemoryTable::new(columns(), vec![rows(0..1)]).hang_on_poll(1);
        let connector = MemoryConnector::new("mem").with_table("t", table);
        let (adapter, notify, _) = adapter(&connector, true, false);

        assert_eq!(adapter.poll().unwrap(), SourcePoll::Pending);
        assert_eq!(adapter.close(), CloseOutcome::Closed);
        assert_eq!(connector.calls_of(CallKind::Close), 1);
        // Still outstanding until the in-flight poll returns
        assert!(adapter.is_outstanding());

        adapter.cancel();
        notify.notified().await;
        assert!(!adapter.is_outstanding());
    }

    #[tokio::test]
    async fn test_transactional_call_stays_open_after_last_batch() {
        let connector = MemoryConnector::new("mem")
            .with_table("t", MemoryTable::new(columns(), vec![rows(0..1)]));
        let (adapter, notify, _) = adapter(&connector, true, false);

        poll_ready(&adapter, &notify).await.unwrap();
        assert!(adapter.is_done());
        assert!(!adapter.is_closed());
        adapter.close();
        assert!(adapter.is_closed());
    }
}
