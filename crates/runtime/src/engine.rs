//! Entry point for running requests.
//!
//! The [`Engine`] owns the shared services every request needs:
//!
//! 1. **Scheduling**: a [`WorkScheduler`] running requests and LOB streams.
//! 2. **Admission**: an [`AdmissionController`] bounding active plans.
//! 3. **Caching**: session aware result and plan caches over one LOB store.
//! 4. **Registry**: live requests by `(session, execution)` id.
//!
//! # Request Lifecycle
//!
//! 1. `submit_request` registers the first window `[1, fetch_size]`.
//! 2. **Admission**: the request is activated or parked in FIFO order.
//! 3. **Processing**: generations run on the scheduler until the plan ends.
//! 4. **Paging**: `request_more` asks for the next window.
//! 5. **Close**: `close_request` (or cancel, or an error) ends the request
//!    and frees its admission slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use sluice_common::config::{AppConfig, EngineSettings};
use sluice_common::lob::{FileLobStore, LobStore, MemoryLobStore};
use sluice_common::models::{RequestId, SessionInfo};
use sluice_connectors::ConnectorRegistry;
use sluice_error::{ErrorCode, ErrorContext, Result, SluiceError};
use tokio::runtime::Handle;
use tracing::{debug, info};
use validator::Validate;

use crate::admission::{Admission, AdmissionController};
use crate::cache::{CachedResults, SessionAwareCache};
use crate::plan::{PlanCompiler, PreparedPlan};
use crate::request::{
    LobChunk, LobReference, PendingResult, QueryRequest, RequestWorkItem, ResultsMessage,
    RowWindow,
};
use crate::scheduler::WorkScheduler;
use crate::snapshot::EngineSnapshot;
use crate::transaction::TransactionService;

pub struct EngineOptions {
    pub config: AppConfig,
    pub connectors: Arc<ConnectorRegistry>,
    pub compiler: Arc<dyn PlanCompiler>,
    pub transactions: Arc<dyn TransactionService>,
    /// Side store for LOB payloads; built from the cache settings when unset.
    pub lob_store: Option<Arc<dyn LobStore>>,
}

/// Live requests by id.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    requests: RwLock<HashMap<RequestId, Arc<RequestWorkItem>>>,
}

impl RequestRegistry {
    fn insert(&self, item: Arc<RequestWorkItem>) -> Result<()> {
        let mut requests = self.requests.write();
        if requests.contains_key(item.id()) {
            return Err(SluiceError::new(
                ErrorCode::DuplicateRequest,
                format!("Request {} is already running", item.id()),
            )
            .with_context(request_context(item.id())));
        }
        requests.insert(item.id().clone(), item);
        Ok(())
    }

    pub(crate) fn get(&self, id: &RequestId) -> Result<Arc<RequestWorkItem>> {
        self.requests.read().get(id).cloned().ok_or_else(|| {
            SluiceError::new(
                ErrorCode::RequestNotFound,
                format!("Request {} does not exist or has already closed", id),
            )
            .with_context(request_context(id))
        })
    }

    pub(crate) fn remove(&self, id: &RequestId) {
        self.requests.write().remove(id);
    }

    fn all(&self) -> Vec<Arc<RequestWorkItem>> {
        let mut items: Vec<_> = self.requests.read().values().cloned().collect();
        items.sort_by(|a, b| a.id().cmp(b.id()));
        items
    }

    fn for_session(&self, session_id: &str) -> Vec<Arc<RequestWorkItem>> {
        self.all()
            .into_iter()
            .filter(|item| item.id().session_id == session_id)
            .collect()
    }

    fn len(&self) -> usize {
        self.requests.read().len()
    }
}

fn request_context(id: &RequestId) -> ErrorContext {
    ErrorContext::Request {
        session_id: id.session_id.clone(),
        execution_id: id.execution_id,
    }
}

/// Services shared by the engine and every request it runs.
pub(crate) struct EngineShared {
    pub(crate) settings: EngineSettings,
    pub(crate) max_cached_rows: usize,
    pub(crate) scheduler: WorkScheduler,
    pub(crate) admission: AdmissionController<RequestWorkItem>,
    pub(crate) registry: RequestRegistry,
    pub(crate) result_cache: SessionAwareCache<CachedResults>,
    pub(crate) plan_cache: SessionAwareCache<PreparedPlan>,
    pub(crate) connectors: Arc<ConnectorRegistry>,
    pub(crate) compiler: Arc<dyn PlanCompiler>,
    pub(crate) transactions: Arc<dyn TransactionService>,
    pub(crate) lob_store: Arc<dyn LobStore>,
    pub(crate) handle: Handle,
}

pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Builds an engine on the current tokio runtime.
    pub fn new(options: EngineOptions) -> anyhow::Result<Self> {
        options
            .config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;
        let handle = Handle::try_current().context("Engine must be created inside a tokio runtime")?;

        let lob_store: Arc<dyn LobStore> = match (options.lob_store, &options.config.cache.lob_directory)
        {
            (Some(store), _) => store,
            (None, Some(directory)) => Arc::new(
                FileLobStore::new(directory)
                    .with_context(|| format!("Failed to open LOB store at {}", directory))?,
            ),
            (None, None) => Arc::new(MemoryLobStore::new()),
        };

        let settings = options.config.engine;
        let cache = options.config.cache;
        let shared = Arc::new(EngineShared {
            scheduler: WorkScheduler::new(settings.max_workers, handle.clone()),
            admission: AdmissionController::new(settings.max_active_plans),
            registry: RequestRegistry::default(),
            result_cache: SessionAwareCache::new("results", &cache.result_cache, lob_store.clone()),
            plan_cache: SessionAwareCache::new("plans", &cache.plan_cache, lob_store.clone()),
            max_cached_rows: cache.max_cached_rows,
            connectors: options.connectors,
            compiler: options.compiler,
            transactions: options.transactions,
            lob_store,
            handle,
            settings,
        });

        info!(
            target: "engine",
            max_active_plans = shared.settings.max_active_plans,
            max_workers = shared.settings.max_workers,
            connectors = ?shared.connectors.names(),
            "Engine started"
        );
        Ok(Self { shared })
    }

    /// Starts a request and returns the receiver for its first window.
    pub fn submit_request(
        &self,
        session: SessionInfo,
        execution_id: u64,
        request: QueryRequest,
    ) -> Result<PendingResult<ResultsMessage>> {
        if self.shared.scheduler.is_shutdown() {
            return Err(SluiceError::new(
                ErrorCode::SubmissionRejected,
                "Engine is shutting down",
            ));
        }
        let id = RequestId::new(session.session_id.clone(), execution_id);
        let fetch_size = request
            .options
            .fetch_size
            .unwrap_or(self.shared.settings.default_fetch_size as u64);
        let window = RowWindow::new(1, fetch_size.max(1))?;

        let item = RequestWorkItem::new(id.clone(), session, request, self.shared.clone());
        self.shared.registry.insert(item.clone())?;
        let pending = item.register_initial_window(window)?;

        match self.shared.admission.admit(item.clone()) {
            Admission::Activated => {
                debug!(target: "engine", request_id = %id, "Request admitted");
                if let Err(e) = self.shared.scheduler.submit(item) {
                    debug!(target: "engine", request_id = %id, error = %e, "Request rejected");
                }
            }
            Admission::Parked { position } => {
                info!(target: "engine", request_id = %id, position, "Request parked until a plan slot frees up");
            }
        }
        Ok(pending)
    }

    pub fn request_more(
        &self,
        id: &RequestId,
        begin: u64,
        end: u64,
    ) -> Result<PendingResult<ResultsMessage>> {
        self.shared.registry.get(id)?.request_more(begin, end)
    }

    /// Returns whether a cancellation was started.
    pub fn cancel_request(&self, id: &RequestId) -> Result<bool> {
        Ok(self.shared.registry.get(id)?.cancel())
    }

    pub fn close_request(&self, id: &RequestId) -> Result<()> {
        self.shared.registry.get(id)?.request_close();
        Ok(())
    }

    /// Requests the next chunk of stream `stream_id`. The first request for a
    /// stream id opens it over the LOB at `reference`; later ones ignore it.
    pub fn request_lob_chunk(
        &self,
        id: &RequestId,
        stream_id: u32,
        reference: LobReference,
    ) -> Result<PendingResult<LobChunk>> {
        let stream = self.shared.registry.get(id)?.lob_stream(stream_id, reference)?;
        let pending = stream.request_chunk()?;
        self.shared.scheduler.submit(stream).map_err(|e| {
            debug!(target: "engine", request_id = %id, stream_id, error = %e, "LOB chunk request rejected");
            e
        })?;
        Ok(pending)
    }

    pub fn close_lob_stream(&self, id: &RequestId, stream_id: u32) -> Result<()> {
        let item = self.shared.registry.get(id)?;
        if let Some(stream) = item.remove_lob_stream(stream_id) {
            stream.close(SluiceError::new(
                ErrorCode::LobNotFound,
                format!("LOB stream {} was closed", stream_id),
            ));
        }
        Ok(())
    }

    /// Cancels and closes every request of a session. Returns how many there were.
    pub fn terminate_session(&self, session_id: &str) -> usize {
        let items = self.shared.registry.for_session(session_id);
        for item in &items {
            item.cancel();
            item.request_close();
        }
        info!(target: "engine", session_id, requests = items.len(), "Session terminated");
        items.len()
    }

    pub fn active_requests(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            requests: self
                .shared
                .registry
                .all()
                .iter()
                .map(|item| item.snapshot())
                .collect(),
            admission: self.shared.admission.stats(),
            scheduler: self.shared.scheduler.stats(),
            result_cache: self.shared.result_cache.stats(),
            plan_cache: self.shared.plan_cache.stats(),
        }
    }

    pub fn clear_caches(&self) {
        self.shared.result_cache.clear_all();
        self.shared.plan_cache.clear_all();
        info!(target: "engine", "Caches cleared");
    }

    /// Drops cached entries of one VDB version. Returns how many were removed.
    pub fn clear_caches_for_vdb(&self, vdb_name: &str, vdb_version: u32) -> usize {
        let removed = self.shared.result_cache.clear_for_vdb(vdb_name, vdb_version)
            + self.shared.plan_cache.clear_for_vdb(vdb_name, vdb_version);
        info!(target: "engine", vdb_name, vdb_version, removed, "Caches cleared for VDB");
        removed
    }

    pub fn lob_store(&self) -> Arc<dyn LobStore> {
        self.shared.lob_store.clone()
    }

    /// Closes every live request and stops the scheduler, waiting up to
    /// `timeout` for running generations. Returns whether it drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let items = self.shared.registry.all();
        info!(target: "engine", requests = items.len(), "Engine shutting down");
        for item in &items {
            item.cancel();
            item.request_close();
        }
        self.shared.scheduler.shutdown(timeout).await
    }
}
