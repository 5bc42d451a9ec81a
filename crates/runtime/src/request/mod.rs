//! The per-request state machine.
//!
//! A [`RequestWorkItem`] moves through `New -> Processing -> Close`. Every
//! generation is one scheduler run: it resumes the request's transaction,
//! advances the state machine until the plan yields, suspends the
//! transaction and then decides whether to requeue itself, sleep until a
//! retry deadline, or go idle until somebody wakes it.
//!
//! Consumers never block a worker. Each interaction registers a one-shot
//! receiver and wakes the item; the receiver is completed from inside a
//! later generation, after the processing lock has been released.

mod delivery;
mod lob;
mod state;

pub use delivery::{PendingResult, ResultsMessage, RowWindow};
pub use lob::{LobChunk, LobReference, LobStream};
pub use state::{ProcessingState, TransactionState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sluice_common::lob::Lob;
use sluice_common::models::{RequestId, SessionInfo};
use sluice_common::types::{ColumnSchema, Row, Value};
use sluice_common::warnings::WarningCollector;
use sluice_connectors::adapter::Waker;
use sluice_connectors::{ConnectorPollAdapter, ExecutionContext, SourceCommand, SourcePoll};
use sluice_error::{ErrorCode, ErrorContext, Result, SluiceError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::admission::Admittable;
use crate::cache::{CacheId, CachedResults};
use crate::engine::EngineShared;
use crate::plan::{PlanContext, PlanExecutor, PlanPoll, PreparedPlan};
use crate::scheduler::{WorkGate, WorkItem};
use crate::snapshot::{RequestSnapshot, SourceSnapshot};
use crate::transaction::{TransactionContext, TransactionScope};
use delivery::{request_closed_error, PendingDelivery};
use state::ResultBuffer;

/// A statement submitted for execution.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub parse_options: String,
    pub parameters: Vec<Value>,
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parse_options: String::new(),
            parameters: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Size of the first window; the engine default when unset.
    pub fetch_size: Option<u64>,
    /// Turn source failures into warnings instead of failing the request.
    pub partial_results: bool,
    pub use_result_cache: bool,
    /// Wrap non-read-only plans in a request-scoped transaction.
    pub autowrap_transactions: bool,
    /// Scheduling priority; lower runs first.
    pub priority: i32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            fetch_size: None,
            partial_results: false,
            use_result_cache: false,
            autowrap_transactions: true,
            priority: 0,
        }
    }
}

/// What a generation asks of the scheduler once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Idle,
    Again,
    After(Duration),
}

type Outgoing = Vec<(oneshot::Sender<Result<ResultsMessage>>, Result<ResultsMessage>)>;

struct Processing {
    state: ProcessingState,
    tx_state: TransactionState,
    prepared: Option<PreparedPlan>,
    plan: Option<Box<dyn PlanExecutor>>,
    columns: Arc<Vec<ColumnSchema>>,
    buffer: ResultBuffer,
    result_cache_id: Option<CacheId>,
    error: Option<SluiceError>,
    from_cache: bool,
    resources_released: bool,
}

pub struct RequestWorkItem {
    id: RequestId,
    session: SessionInfo,
    request: QueryRequest,
    engine: Arc<EngineShared>,
    this: Weak<RequestWorkItem>,
    gate: WorkGate,
    created_at: Instant,

    canceled: AtomicBool,
    close_requested: AtomicBool,
    active: AtomicBool,
    closed: AtomicBool,
    done_producing: AtomicBool,
    state_mirror: AtomicU8,
    tx_state_mirror: AtomicU8,
    rows_buffered: AtomicU64,
    highest_requested: AtomicU64,
    next_source_id: AtomicU32,

    sources: Mutex<HashMap<u32, Arc<ConnectorPollAdapter>>>,
    warnings: WarningCollector,
    delivery: Mutex<Option<PendingDelivery>>,
    transaction: Mutex<Option<TransactionContext>>,
    // Lock order: lob_streams before delivered_lobs.
    lob_streams: Mutex<HashMap<u32, Arc<LobStream>>>,
    delivered_lobs: Mutex<HashMap<LobReference, Lob>>,
    processing: Mutex<Processing>,
}

impl RequestWorkItem {
    pub(crate) fn new(
        id: RequestId,
        session: SessionInfo,
        request: QueryRequest,
        engine: Arc<EngineShared>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            session,
            request,
            engine,
            this: this.clone(),
            gate: WorkGate::new(),
            created_at: Instant::now(),
            canceled: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            done_producing: AtomicBool::new(false),
            state_mirror: AtomicU8::new(ProcessingState::New.into()),
            tx_state_mirror: AtomicU8::new(TransactionState::None.into()),
            rows_buffered: AtomicU64::new(0),
            highest_requested: AtomicU64::new(0),
            next_source_id: AtomicU32::new(0),
            sources: Mutex::new(HashMap::new()),
            warnings: WarningCollector::new(),
            delivery: Mutex::new(None),
            transaction: Mutex::new(None),
            lob_streams: Mutex::new(HashMap::new()),
            delivered_lobs: Mutex::new(HashMap::new()),
            processing: Mutex::new(Processing {
                state: ProcessingState::New,
                tx_state: TransactionState::None,
                prepared: None,
                plan: None,
                columns: Arc::new(Vec::new()),
                buffer: ResultBuffer::default(),
                result_cache_id: None,
                error: None,
                from_cache: false,
                resources_released: false,
            }),
        })
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn processing_state(&self) -> ProcessingState {
        self.state_mirror.load(Ordering::SeqCst).into()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.tx_state_mirror.load(Ordering::SeqCst).into()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_done_producing(&self) -> bool {
        self.done_producing.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn is_terminating(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.close_requested.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Consumer-facing operations. None of these block on processing.
    // ---------------------------------------------------------------------

    /// Registers the first window without waking; admission decides when the
    /// request starts.
    pub(crate) fn register_initial_window(
        &self,
        window: RowWindow,
    ) -> Result<PendingResult<ResultsMessage>> {
        self.register_delivery(window)
    }

    /// Asks for rows `[begin, end]`. At most one window may be outstanding.
    pub fn request_more(&self, begin: u64, end: u64) -> Result<PendingResult<ResultsMessage>> {
        let window = RowWindow::new(begin, end)?;
        let pending = self.register_delivery(window)?;
        trace!(target: "request", request_id = %self.id, begin, end, "More results requested");
        self.wake();
        Ok(pending)
    }

    fn register_delivery(&self, window: RowWindow) -> Result<PendingResult<ResultsMessage>> {
        let mut slot = self.delivery.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(request_closed_error(&self.id));
        }
        if slot.is_some() {
            return Err(SluiceError::new(
                ErrorCode::DeliveryPending,
                format!("Request {} already has a result window pending", self.id),
            )
            .with_context(ErrorContext::Window {
                begin_row: window.begin,
                end_row: window.end,
            })
            .with_hint("Wait for the previous window before requesting the next one"));
        }
        let (sender, receiver) = oneshot::channel();
        *slot = Some(PendingDelivery { window, sender });
        self.highest_requested.fetch_max(window.end, Ordering::SeqCst);
        Ok(PendingResult::new(receiver))
    }

    /// Requests cancellation. Returns false when there is nothing left to
    /// cancel: the request already closed, finished producing, or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.done_producing.load(Ordering::SeqCst) {
            return false;
        }
        if self.canceled.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(target: "request", request_id = %self.id, "Cancelling request");

        for adapter in self.adapters() {
            adapter.cancel();
        }
        let transaction = self.transaction.lock().clone();
        if let Some(context) = transaction.filter(|c| c.scope == TransactionScope::Request) {
            if let Err(e) = self.engine.transactions.cancel(&context) {
                warn!(target: "request", request_id = %self.id, error = %e, "Failed to cancel transaction");
            }
        }
        self.withdraw_if_parked();
        self.wake();
        true
    }

    /// Asks the request to close. Completes asynchronously.
    pub fn request_close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.close_requested.swap(true, Ordering::SeqCst) {
            debug!(target: "request", request_id = %self.id, "Close requested");
        }
        self.withdraw_if_parked();
        self.wake();
    }

    /// Returns the stream registered as `stream_id`, opening it over the LOB
    /// at `reference` of a delivered row when there is none.
    pub(crate) fn lob_stream(
        &self,
        stream_id: u32,
        reference: LobReference,
    ) -> Result<Arc<LobStream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(request_closed_error(&self.id));
        }
        let mut streams = self.lob_streams.lock();
        if let Some(stream) = streams.get(&stream_id) {
            return Ok(stream.clone());
        }
        let lob = self
            .delivered_lobs
            .lock()
            .get(&reference)
            .cloned()
            .ok_or_else(|| {
                SluiceError::new(
                    ErrorCode::LobNotFound,
                    format!(
                        "No LOB was delivered at row {} column {} of request {}",
                        reference.row, reference.column, self.id
                    ),
                )
            })?;
        let stream = Arc::new(LobStream::new(
            stream_id,
            self.id.clone(),
            lob,
            self.engine.lob_store.clone(),
            self.engine.settings.lob_chunk_size,
            self.this.clone(),
        ));
        streams.insert(stream_id, stream.clone());
        debug!(target: "request", request_id = %self.id, stream_id, row = reference.row, column = reference.column, "LOB stream opened");
        Ok(stream)
    }

    pub(crate) fn remove_lob_stream(&self, stream_id: u32) -> Option<Arc<LobStream>> {
        self.lob_streams.lock().remove(&stream_id)
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        let mut sources: Vec<SourceSnapshot> =
            self.adapters().iter().map(|a| SourceSnapshot::from(a.as_ref())).collect();
        sources.sort_by_key(|s| s.source_request_id);
        RequestSnapshot {
            request_id: self.id.clone(),
            sql: self.request.sql.clone(),
            processing_state: self.processing_state(),
            thread_state: self.gate.state(),
            transaction_state: self.transaction_state(),
            active: self.active.load(Ordering::SeqCst),
            canceled: self.canceled.load(Ordering::SeqCst),
            close_requested: self.close_requested.load(Ordering::SeqCst),
            done_producing: self.done_producing.load(Ordering::SeqCst),
            rows_buffered: self.rows_buffered.load(Ordering::SeqCst),
            highest_requested: self.highest_requested.load(Ordering::SeqCst),
            open_lob_streams: self.lob_streams.lock().len(),
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            sources,
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling helpers
    // ---------------------------------------------------------------------

    pub(crate) fn wake(&self) {
        if let Some(this) = self.this.upgrade() {
            if let Err(e) = self.engine.scheduler.submit(this) {
                debug!(target: "request", request_id = %self.id, error = %e, "Wake-up rejected");
            }
        }
    }

    fn wake_after(&self, delay: Duration) {
        if let Some(this) = self.this.upgrade() {
            self.engine.scheduler.schedule_after(this, delay);
        }
    }

    fn withdraw_if_parked(&self) {
        if let Some(this) = self.this.upgrade() {
            if self.engine.admission.withdraw(&this) {
                debug!(target: "request", request_id = %self.id, "Withdrawn from admission queue");
            }
        }
    }

    fn release_admission(&self) {
        if let Some(next) = self.engine.admission.release(self) {
            debug!(target: "request", request_id = %next.id, "Admitted from queue");
            if let Err(e) = self.engine.scheduler.submit(next) {
                debug!(target: "request", error = %e, "Admitted request could not be scheduled");
            }
        }
    }

    fn adapters(&self) -> Vec<Arc<ConnectorPollAdapter>> {
        self.sources.lock().values().cloned().collect()
    }

    fn has_poll_in_flight(&self) -> bool {
        self.sources.lock().values().any(|a| a.is_in_flight())
    }

    fn set_state(&self, processing: &mut Processing, state: ProcessingState) {
        if processing.state != state {
            trace!(target: "request", request_id = %self.id, from = ?processing.state, to = ?state, "State change");
            processing.state = state;
            self.state_mirror.store(state.into(), Ordering::SeqCst);
        }
    }

    fn set_tx_state(&self, processing: &mut Processing, state: TransactionState) {
        processing.tx_state = state;
        self.tx_state_mirror.store(state.into(), Ordering::SeqCst);
    }

    /// Keeps the first error; later ones are only logged.
    fn record_error(&self, processing: &mut Processing, err: SluiceError) {
        if err.is_component_error() {
            error!(target: "request", request_id = %self.id, code = %err.code, error = %err, "Request failed");
        } else {
            debug!(target: "request", request_id = %self.id, code = %err.code, error = %err, "Request error");
        }
        if processing.error.is_none() {
            processing.error = Some(err);
        }
    }

    // ---------------------------------------------------------------------
    // Generations
    // ---------------------------------------------------------------------

    fn run_generation(&self) {
        let mut outgoing = Outgoing::new();
        let next = {
            let mut processing = self.processing.lock();
            if self.closed.load(Ordering::SeqCst) {
                drop(processing);
                self.reject_late_delivery();
                return;
            }

            let transaction = self.transaction.lock().clone();
            if let Some(context) = &transaction {
                if let Err(e) = self.engine.transactions.resume(context) {
                    warn!(target: "request", request_id = %self.id, error = %e, "Failed to resume transaction");
                }
            }

            let next = self.step(&mut processing, &mut outgoing);

            if !self.closed.load(Ordering::SeqCst) {
                let transaction = self.transaction.lock().clone();
                if let Some(context) = &transaction {
                    if let Err(e) = self.engine.transactions.suspend(context) {
                        warn!(target: "request", request_id = %self.id, error = %e, "Failed to suspend transaction");
                    }
                }
            }
            next
        };

        send_all(outgoing);
        match next {
            Next::Idle => {}
            Next::Again => self.wake(),
            Next::After(delay) => self.wake_after(delay),
        }
    }

    fn step(&self, processing: &mut Processing, outgoing: &mut Outgoing) -> Next {
        if processing.state == ProcessingState::New {
            if self.is_terminating() {
                if self.canceled.load(Ordering::SeqCst) {
                    self.record_error(processing, SluiceError::cancelled(&self.id));
                }
                self.set_state(processing, ProcessingState::Close);
            } else if !self.active.load(Ordering::SeqCst) {
                trace!(target: "request", request_id = %self.id, "Waiting for admission");
                return Next::Idle;
            } else {
                match self.process_new(processing) {
                    Ok(()) => self.set_state(processing, ProcessingState::Processing),
                    Err(e) => {
                        self.record_error(processing, e);
                        self.set_state(processing, ProcessingState::Close);
                    }
                }
            }
        }

        if processing.state == ProcessingState::Processing {
            if self.canceled.load(Ordering::SeqCst) && !self.done_producing.load(Ordering::SeqCst)
            {
                if let Some(plan) = processing.plan.as_mut() {
                    plan.cancel();
                }
                self.record_error(processing, SluiceError::cancelled(&self.id));
                self.set_state(processing, ProcessingState::Close);
            } else {
                match self.process_more(processing, outgoing) {
                    Ok(next) if !self.close_requested.load(Ordering::SeqCst) => return next,
                    Ok(_) => self.set_state(processing, ProcessingState::Close),
                    Err(e) => {
                        self.record_error(processing, e);
                        self.set_state(processing, ProcessingState::Close);
                    }
                }
            }
        }

        self.close(processing, outgoing);
        Next::Idle
    }

    fn process_new(&self, processing: &mut Processing) -> Result<()> {
        let options = &self.request.options;
        let cache_id = CacheId::new(&self.request.sql, &self.request.parse_options, &self.session)
            .with_parameters(&self.request.parameters);

        if options.use_result_cache && self.engine.result_cache.is_enabled() {
            if let Some(cached) = self.engine.result_cache.get(&cache_id) {
                info!(
                    target: "request",
                    request_id = %self.id,
                    rows = cached.row_count(),
                    "Serving results from cache"
                );
                processing.columns = cached.columns.clone();
                processing.buffer = ResultBuffer::complete(cached.rows.to_vec());
                processing.from_cache = true;
                self.rows_buffered
                    .store(processing.buffer.row_count(), Ordering::SeqCst);
                self.done_producing.store(true, Ordering::SeqCst);
                self.release_admission();
                return Ok(());
            }
            processing.result_cache_id = Some(cache_id);
        }

        let plan_id = CacheId::new(&self.request.sql, &self.request.parse_options, &self.session);
        let prepared = match self.engine.plan_cache.get(&plan_id) {
            Some(prepared) => {
                trace!(target: "request", request_id = %self.id, "Plan cache hit");
                prepared
            }
            None => {
                let prepared = self.engine.compiler.compile(&self.request.sql, &self.session)?;
                self.engine
                    .plan_cache
                    .put(&plan_id, prepared.determinism, prepared.clone(), None);
                prepared
            }
        };

        if self.canceled.load(Ordering::SeqCst) {
            return Err(SluiceError::cancelled(&self.id));
        }

        let mut context = self
            .engine
            .transactions
            .get_or_create_context(&self.session.session_id)?;
        if context.scope == TransactionScope::None
            && !prepared.read_only
            && options.autowrap_transactions
        {
            self.engine
                .transactions
                .begin(&mut context, TransactionScope::Request)?;
            self.set_tx_state(processing, TransactionState::Active);
            info!(
                target: "request",
                request_id = %self.id,
                transaction_id = context.transaction_id.as_deref().unwrap_or_default(),
                "Request transaction started"
            );
        }
        *self.transaction.lock() = Some(context);

        processing.columns = Arc::new(prepared.columns.clone());
        processing.plan = Some(prepared.factory.instantiate()?);
        processing.prepared = Some(prepared);
        debug!(target: "request", request_id = %self.id, "Plan instantiated");
        Ok(())
    }

    fn process_more(&self, processing: &mut Processing, outgoing: &mut Outgoing) -> Result<Next> {
        self.deliver_if_ready(processing, outgoing);
        if self.done_producing.load(Ordering::SeqCst) {
            return Ok(Next::Idle);
        }

        let started = Instant::now();
        let time_slice = Duration::from_millis(self.engine.settings.time_slice_ms);
        loop {
            if self.canceled.load(Ordering::SeqCst) {
                return Ok(Next::Again);
            }
            let limit = self
                .highest_requested
                .load(Ordering::SeqCst)
                .saturating_add(self.engine.settings.max_buffered_rows as u64);
            if processing.buffer.row_count() >= limit {
                trace!(target: "request", request_id = %self.id, buffered = processing.buffer.row_count(), "Result buffer full");
                return Ok(Next::Idle);
            }

            let Some(plan) = processing.plan.as_mut() else {
                return Err(SluiceError::internal(format!(
                    "Request {} is processing without a plan",
                    self.id
                )));
            };
            let mut context = SourceAccess {
                item: self,
                started,
                time_slice,
            };
            let poll = plan.next_batch(&mut context)?;
            self.warnings.extend(plan.take_warnings());

            match poll {
                PlanPoll::Batch(batch) => {
                    processing.buffer.append(batch.rows);
                    self.rows_buffered
                        .store(processing.buffer.row_count(), Ordering::SeqCst);
                    if batch.last {
                        processing.buffer.finish();
                        self.done_producing.store(true, Ordering::SeqCst);
                        debug!(
                            target: "request",
                            request_id = %self.id,
                            rows = processing.buffer.row_count(),
                            "Final batch produced"
                        );
                        self.on_final_batch(processing)?;
                        if outgoing.is_empty() {
                            self.deliver_if_ready(processing, outgoing);
                        }
                        return Ok(Next::Idle);
                    }
                    if outgoing.is_empty() {
                        self.deliver_if_ready(processing, outgoing);
                    }
                    if started.elapsed() >= time_slice {
                        return Ok(Next::Again);
                    }
                }
                PlanPoll::Blocked => {
                    // A poll in flight wakes the request when it completes.
                    return Ok(if self.has_poll_in_flight() {
                        Next::Idle
                    } else {
                        Next::Again
                    });
                }
                PlanPoll::RetryAfter(delay) => return Ok(Next::After(delay)),
            }
        }
    }

    fn on_final_batch(&self, processing: &mut Processing) -> Result<()> {
        for adapter in self.adapters().iter().filter(|a| a.is_transactional()) {
            adapter.close();
        }
        if processing.tx_state == TransactionState::Active {
            self.set_tx_state(processing, TransactionState::Ending);
            let transaction = self.transaction.lock().clone();
            let result = match &transaction {
                Some(context) => self.engine.transactions.commit(context),
                None => Ok(()),
            };
            self.set_tx_state(processing, TransactionState::Done);
            result?;
            info!(target: "request", request_id = %self.id, "Request transaction committed");
        }
        self.release_admission();
        Ok(())
    }

    /// Completes the pending window once enough rows exist, or once the
    /// result is complete. Only a final window may come back short.
    fn deliver_if_ready(&self, processing: &mut Processing, outgoing: &mut Outgoing) {
        let pending = {
            let mut slot = self.delivery.lock();
            let Some(pending) = slot.as_ref() else {
                return;
            };
            let ready = processing.buffer.row_count() >= pending.window.end
                || self.done_producing.load(Ordering::SeqCst);
            if !ready {
                return;
            }
            match slot.take() {
                Some(pending) => pending,
                None => return,
            }
        };

        let window = pending.window;
        let rows = processing.buffer.window(window).to_vec();
        let first_row = window.begin;
        let last_row = first_row + rows.len() as u64 - 1;
        let final_row = processing.buffer.final_row();
        let is_last = final_row.is_some_and(|f| last_row >= f);
        self.remember_lobs(first_row, &rows);

        trace!(
            target: "request",
            request_id = %self.id,
            first_row,
            last_row,
            is_last,
            "Delivering results"
        );
        let message = ResultsMessage {
            columns: processing.columns.clone(),
            first_row,
            last_row,
            rows,
            final_row,
            is_last,
            warnings: self.warnings.drain(),
            from_cache: processing.from_cache,
        };
        outgoing.push((pending.sender, Ok(message)));
    }

    fn remember_lobs(&self, first_row: u64, rows: &[Row]) {
        let mut lobs = self.delivered_lobs.lock();
        for (offset, row) in rows.iter().enumerate() {
            for (column, value) in row.iter().enumerate() {
                if let Some(lob) = value.as_lob() {
                    let reference = LobReference {
                        row: first_row + offset as u64,
                        column,
                    };
                    lobs.insert(reference, lob.clone());
                }
            }
        }
    }

    /// Runs the close path. Re-entrant: while a request-scoped transaction
    /// still has downstream calls outstanding, it returns early and the
    /// completion of those calls re-enters it.
    fn close(&self, processing: &mut Processing, outgoing: &mut Outgoing) {
        self.set_state(processing, ProcessingState::Close);

        if !processing.resources_released {
            processing.resources_released = true;
            if processing.error.is_none() && outgoing.is_empty() {
                self.deliver_if_ready(processing, outgoing);
            }
            self.populate_result_cache(processing);
            if let Some(mut plan) = processing.plan.take() {
                plan.close();
            }
            processing.buffer.release();
        }

        let adapters = self.adapters();
        for adapter in &adapters {
            adapter.close();
        }
        if processing.tx_state == TransactionState::Active
            && adapters.iter().any(|a| a.is_outstanding())
        {
            debug!(target: "request", request_id = %self.id, "Close deferred until downstream calls complete");
            return;
        }
        self.end_transaction(processing);

        self.closed.store(true, Ordering::SeqCst);
        self.gate.finish();
        self.release_admission();
        self.withdraw_if_parked();
        self.engine.registry.remove(&self.id);

        let streams: Vec<Arc<LobStream>> = self.lob_streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.close(request_closed_error(&self.id));
        }
        self.delivered_lobs.lock().clear();
        self.sources.lock().clear();
        *self.transaction.lock() = None;

        if let Some(pending) = self.delivery.lock().take() {
            let err = processing
                .error
                .clone()
                .unwrap_or_else(|| request_closed_error(&self.id));
            outgoing.push((pending.sender, Err(err)));
        }

        match &processing.error {
            Some(e) => info!(target: "request", request_id = %self.id, code = %e.code, "Request closed with error"),
            None => info!(target: "request", request_id = %self.id, "Request closed"),
        }
    }

    fn populate_result_cache(&self, processing: &Processing) {
        let (Some(cache_id), Some(prepared)) =
            (processing.result_cache_id.as_ref(), processing.prepared.as_ref())
        else {
            return;
        };
        let eligible = prepared.read_only
            && prepared.determinism.is_cacheable()
            && self.done_producing.load(Ordering::SeqCst)
            && !self.canceled.load(Ordering::SeqCst)
            && processing.error.is_none()
            && !processing.from_cache
            && processing.buffer.row_count() as usize <= self.engine.max_cached_rows;
        if !eligible {
            return;
        }
        match CachedResults::capture(
            processing.columns.to_vec(),
            processing.buffer.rows(),
            prepared.determinism,
            self.engine.lob_store.as_ref(),
        ) {
            Ok(results) => {
                if self
                    .engine
                    .result_cache
                    .put(cache_id, prepared.determinism, results, None)
                {
                    debug!(target: "request", request_id = %self.id, "Results cached");
                }
            }
            Err(e) => {
                warn!(target: "request", request_id = %self.id, error = %e, "Failed to capture results for caching");
            }
        }
    }

    fn end_transaction(&self, processing: &mut Processing) {
        if processing.tx_state != TransactionState::Active {
            return;
        }
        self.set_tx_state(processing, TransactionState::Ending);
        let transaction = self.transaction.lock().clone();
        if let Some(context) = transaction {
            let commit = self.done_producing.load(Ordering::SeqCst) && processing.error.is_none();
            let result = if commit {
                self.engine.transactions.commit(&context)
            } else {
                self.engine.transactions.rollback(&context)
            };
            match result {
                Ok(()) if commit => {
                    info!(target: "request", request_id = %self.id, "Request transaction committed")
                }
                Ok(()) => {
                    info!(target: "request", request_id = %self.id, "Request transaction rolled back")
                }
                Err(e) => {
                    warn!(target: "request", request_id = %self.id, error = %e, "Failed to end transaction");
                    if commit {
                        self.record_error(processing, e);
                    }
                }
            }
        }
        self.set_tx_state(processing, TransactionState::Done);
    }

    /// A wake-up that arrives after close only has to fail a receiver that
    /// raced the close.
    fn reject_late_delivery(&self) {
        let pending = self.delivery.lock().take();
        if let Some(pending) = pending {
            let _ = pending.sender.send(Err(request_closed_error(&self.id)));
        }
    }

    fn fail(&self, err: SluiceError) {
        let mut outgoing = Outgoing::new();
        {
            let mut processing = self.processing.lock();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            self.record_error(&mut processing, err);
            if let Some(plan) = processing.plan.as_mut() {
                plan.cancel();
            }
            self.close(&mut processing, &mut outgoing);
        }
        send_all(outgoing);
    }

    fn open_source(&self, command: &SourceCommand) -> Result<u32> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(SluiceError::cancelled(&self.id));
        }
        let connector = self.engine.connectors.get(&command.connector)?;
        let source_request_id = self.next_source_id.fetch_add(1, Ordering::SeqCst);
        let transactional = self
            .transaction
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_transactional());
        let context = ExecutionContext {
            request_id: self.id.clone(),
            source_request_id,
            transactional,
            partial_results: self.request.options.partial_results,
        };
        let execution = connector.create_execution(command, &context)?;

        let weak = self.this.clone();
        let waker: Waker = Arc::new(move || {
            if let Some(item) = weak.upgrade() {
                item.wake();
            }
        });
        let adapter = Arc::new(ConnectorPollAdapter::new(
            command.connector.clone(),
            command.table.clone(),
            &command.columns,
            context,
            execution,
            self.engine.lob_store.clone(),
            self.engine.handle.clone(),
            waker,
            self.warnings.clone(),
        ));
        self.sources.lock().insert(source_request_id, adapter.clone());
        // A cancel that raced the insert did not see this adapter.
        if self.canceled.load(Ordering::SeqCst) {
            adapter.cancel();
        }
        debug!(
            target: "request",
            request_id = %self.id,
            source_request_id,
            connector = %command.connector,
            table = %command.table,
            transactional,
            "Source call opened"
        );
        Ok(source_request_id)
    }

    fn source(&self, source_request_id: u32) -> Result<Arc<ConnectorPollAdapter>> {
        self.sources
            .lock()
            .get(&source_request_id)
            .cloned()
            .ok_or_else(|| {
                SluiceError::internal(format!(
                    "Request {} has no source call {}",
                    self.id, source_request_id
                ))
            })
    }
}

fn send_all(outgoing: Outgoing) {
    for (sender, result) in outgoing {
        // The consumer may have stopped waiting.
        let _ = sender.send(result);
    }
}

impl WorkItem for RequestWorkItem {
    fn name(&self) -> String {
        format!("request {}", self.id)
    }

    fn gate(&self) -> &WorkGate {
        &self.gate
    }

    fn priority(&self) -> i32 {
        self.request.options.priority
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn run(&self) {
        self.run_generation();
    }

    fn on_rejected(&self, error: SluiceError) {
        self.fail(error);
    }

    fn on_failure(&self, error: SluiceError) {
        self.fail(error);
    }
}

impl Admittable for RequestWorkItem {
    fn admission_key(&self) -> String {
        self.id.to_string()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RequestWorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestWorkItem")
            .field("id", &self.id)
            .field("state", &self.processing_state())
            .field("thread_state", &self.gate.state())
            .finish_non_exhaustive()
    }
}

/// The request as seen by its plan during one generation.
struct SourceAccess<'a> {
    item: &'a RequestWorkItem,
    started: Instant,
    time_slice: Duration,
}

impl PlanContext for SourceAccess<'_> {
    fn open_source(&mut self, command: &SourceCommand) -> Result<u32> {
        self.item.open_source(command)
    }

    fn poll_source(&mut self, source_request_id: u32) -> Result<SourcePoll> {
        self.item.source(source_request_id)?.poll()
    }

    fn close_source(&mut self, source_request_id: u32) {
        if let Ok(adapter) = self.item.source(source_request_id) {
            adapter.close();
        }
    }

    fn is_canceled(&self) -> bool {
        self.item.canceled.load(Ordering::SeqCst)
    }

    fn time_slice_expired(&self) -> bool {
        self.started.elapsed() >= self.time_slice
    }
}
