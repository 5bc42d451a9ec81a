//! Chunked delivery of large objects referenced by delivered rows.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_common::lob::{Lob, LobStore};
use sluice_common::models::RequestId;
use sluice_error::{ErrorCode, Result, SluiceError};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::delivery::PendingResult;
use super::RequestWorkItem;
use crate::scheduler::{WorkGate, WorkItem};

/// A LOB cell of a delivered row. Rows are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LobReference {
    pub row: u64,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobChunk {
    pub stream_id: u32,
    /// 0-based position of the chunk in the stream.
    pub chunk_id: u64,
    pub bytes: Vec<u8>,
    pub is_last: bool,
}

struct StreamState {
    offset: u64,
    next_chunk: u64,
    pending: Option<oneshot::Sender<Result<LobChunk>>>,
    finished: bool,
}

/// Reads one LOB a chunk at a time, one outstanding chunk request at most.
pub struct LobStream {
    stream_id: u32,
    request_id: RequestId,
    lob: Lob,
    store: Arc<dyn LobStore>,
    chunk_size: usize,
    gate: WorkGate,
    created_at: Instant,
    parent: Weak<RequestWorkItem>,
    state: Mutex<StreamState>,
}

impl LobStream {
    pub(crate) fn new(
        stream_id: u32,
        request_id: RequestId,
        lob: Lob,
        store: Arc<dyn LobStore>,
        chunk_size: usize,
        parent: Weak<RequestWorkItem>,
    ) -> Self {
        Self {
            stream_id,
            request_id,
            lob,
            store,
            chunk_size: chunk_size.max(1),
            gate: WorkGate::new(),
            created_at: Instant::now(),
            parent,
            state: Mutex::new(StreamState {
                offset: 0,
                next_chunk: 0,
                pending: None,
                finished: false,
            }),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Registers the receiver for the next chunk. The caller wakes the stream.
    pub(crate) fn request_chunk(&self) -> Result<PendingResult<LobChunk>> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(SluiceError::new(
                ErrorCode::LobNotFound,
                format!("LOB stream {} has already finished", self.stream_id),
            ));
        }
        if state.pending.is_some() {
            return Err(SluiceError::new(
                ErrorCode::LobStreamBusy,
                format!("LOB stream {} already has a chunk request pending", self.stream_id),
            )
            .with_hint("Wait for the previous chunk before requesting the next one"));
        }
        let (sender, receiver) = oneshot::channel();
        state.pending = Some(sender);
        Ok(PendingResult::new(receiver))
    }

    /// Ends the stream, failing any pending chunk request.
    pub(crate) fn close(&self, error: SluiceError) {
        let pending = {
            let mut state = self.state.lock();
            state.finished = true;
            state.pending.take()
        };
        self.gate.finish();
        if let Some(sender) = pending {
            let _ = sender.send(Err(error));
        }
    }

    fn unregister(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_lob_stream(self.stream_id);
        }
    }

    fn read_next(&self, offset: u64, chunk_id: u64) -> Result<LobChunk> {
        let bytes = self
            .lob
            .read_chunk(self.store.as_ref(), offset, self.chunk_size)?;
        let read_to = offset + bytes.len() as u64;
        let is_last = bytes.len() < self.chunk_size
            || self.lob.length().is_some_and(|length| read_to >= length);
        Ok(LobChunk {
            stream_id: self.stream_id,
            chunk_id,
            bytes,
            is_last,
        })
    }
}

impl WorkItem for LobStream {
    fn name(&self) -> String {
        format!("lob stream {} of request {}", self.stream_id, self.request_id)
    }

    fn gate(&self) -> &WorkGate {
        &self.gate
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn run(&self) {
        let (sender, offset, chunk_id) = {
            let mut state = self.state.lock();
            let Some(sender) = state.pending.take() else {
                return;
            };
            (sender, state.offset, state.next_chunk)
        };

        let result = self.read_next(offset, chunk_id);
        let finished = match &result {
            Ok(chunk) => {
                let mut state = self.state.lock();
                state.offset = offset + chunk.bytes.len() as u64;
                state.next_chunk += 1;
                state.finished = chunk.is_last;
                trace!(
                    target: "request",
                    stream_id = self.stream_id,
                    chunk_id,
                    bytes = chunk.bytes.len(),
                    "LOB chunk read"
                );
                chunk.is_last
            }
            Err(e) => {
                debug!(target: "request", stream_id = self.stream_id, error = %e, "LOB read failed");
                self.state.lock().finished = true;
                true
            }
        };

        if finished {
            self.gate.finish();
            self.unregister();
        }
        let _ = sender.send(result);
    }

    fn on_rejected(&self, error: SluiceError) {
        self.close(error);
        self.unregister();
    }

    fn on_failure(&self, error: SluiceError) {
        self.close(error);
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::lob::MemoryLobStore;

    fn stream(bytes: &[u8], chunk_size: usize) -> LobStream {
        LobStream::new(
            0,
            RequestId::new("s", 1),
            Lob::inline(bytes.to_vec()),
            Arc::new(MemoryLobStore::new()),
            chunk_size,
            Weak::new(),
        )
    }

    #[tokio::test]
    async fn test_one_chunk_request_at_a_time() {
        let stream = stream(b"abcdef", 4);
        let first = stream.request_chunk().unwrap();
        let err = stream.request_chunk().unwrap_err();
        assert_eq!(err.code, ErrorCode::LobStreamBusy);

        stream.run();
        let chunk = first.await.unwrap();
        assert_eq!((chunk.chunk_id, chunk.bytes.as_slice(), chunk.is_last), (0, &b"abcd"[..], false));

        let second = stream.request_chunk().unwrap();
        stream.run();
        let chunk = second.await.unwrap();
        assert_eq!((chunk.chunk_id, chunk.bytes.as_slice(), chunk.is_last), (1, &b"ef"[..], true));

        let err = stream.request_chunk().unwrap_err();
        assert_eq!(err.code, ErrorCode::LobNotFound);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_known_length() {
        let stream = stream(b"abcd", 2);
        let mut last = false;
        let mut chunks = 0;
        while !last {
            let pending = stream.request_chunk().unwrap();
            stream.run();
            last = pending.await.unwrap().is_last;
            chunks += 1;
        }
        assert_eq!(chunks, 2);
    }

    #[tokio::test]
    async fn test_close_fails_pending_request() {
        let stream = stream(b"abc", 2);
        let pending = stream.request_chunk().unwrap();
        stream.close(SluiceError::new(ErrorCode::RequestClosed, "closed"));
        assert_eq!(pending.await.unwrap_err().code, ErrorCode::RequestClosed);
        assert_eq!(stream.gate().state(), crate::scheduler::ThreadState::Done);
    }
}
