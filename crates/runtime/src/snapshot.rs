//! Point-in-time views of engine state for admin and monitoring callers.
//!
//! Snapshots read atomics and short-lived locks only; they never wait on a
//! request's processing lock.

use serde::{Deserialize, Serialize};
use sluice_common::models::RequestId;
use sluice_connectors::{CallState, ConnectorPollAdapter};

use crate::admission::AdmissionStats;
use crate::cache::CacheStats;
use crate::request::{ProcessingState, TransactionState};
use crate::scheduler::{SchedulerStats, ThreadState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source_request_id: u32,
    pub connector: String,
    pub table: String,
    pub state: CallState,
    pub transactional: bool,
    pub rows_processed: u64,
    pub done: bool,
    pub closed: bool,
}

impl From<&ConnectorPollAdapter> for SourceSnapshot {
    fn from(adapter: &ConnectorPollAdapter) -> Self {
        Self {
            source_request_id: adapter.source_request_id(),
            connector: adapter.connector().to_string(),
            table: adapter.table().to_string(),
            state: adapter.call_state(),
            transactional: adapter.is_transactional(),
            rows_processed: adapter.rows_processed(),
            done: adapter.is_done(),
            closed: adapter.is_closed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request_id: RequestId,
    pub sql: String,
    pub processing_state: ProcessingState,
    pub thread_state: ThreadState,
    pub transaction_state: TransactionState,
    /// Holds an admission slot.
    pub active: bool,
    pub canceled: bool,
    pub close_requested: bool,
    pub done_producing: bool,
    pub rows_buffered: u64,
    pub highest_requested: u64,
    pub open_lob_streams: usize,
    pub elapsed_ms: u64,
    pub sources: Vec<SourceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub requests: Vec<RequestSnapshot>,
    pub admission: AdmissionStats,
    pub scheduler: SchedulerStats,
    pub result_cache: CacheStats,
    pub plan_cache: CacheStats,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
