//! Result windows and the one-shot handles consumers wait on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use sluice_common::models::RequestId;
use sluice_common::types::{ColumnSchema, Row};
use sluice_common::warnings::QueryWarning;
use sluice_error::{ErrorCode, ErrorContext, Result, SluiceError};
use tokio::sync::oneshot;

/// Inclusive, 1-based row range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWindow {
    pub begin: u64,
    pub end: u64,
}

impl RowWindow {
    pub fn new(begin: u64, end: u64) -> Result<Self> {
        if begin == 0 || end < begin {
            return Err(SluiceError::new(
                ErrorCode::InvalidWindow,
                format!("Invalid row window [{}, {}]", begin, end),
            )
            .with_context(ErrorContext::Window {
                begin_row: begin,
                end_row: end,
            })
            .with_hint("Rows are numbered from 1 and the end row must not precede the begin row"));
        }
        Ok(Self { begin, end })
    }
}

/// One delivered window of results.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsMessage {
    pub columns: Arc<Vec<ColumnSchema>>,
    pub first_row: u64,
    /// `first_row - 1` when the window is empty.
    pub last_row: u64,
    pub rows: Vec<Row>,
    /// Total row count, once the final batch has been produced.
    pub final_row: Option<u64>,
    pub is_last: bool,
    pub warnings: Vec<QueryWarning>,
    pub from_cache: bool,
}

pub(crate) struct PendingDelivery {
    pub(crate) window: RowWindow,
    pub(crate) sender: oneshot::Sender<Result<ResultsMessage>>,
}

/// A value delivered exactly once, by the engine, to one consumer.
#[derive(Debug)]
pub struct PendingResult<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> PendingResult<T> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self { receiver }
    }

    /// Returns the value if it has already been delivered.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped_error())),
        }
    }
}

fn dropped_error() -> SluiceError {
    SluiceError::new(
        ErrorCode::RequestClosed,
        "Request ended without delivering a result",
    )
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(dropped_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn request_closed_error(id: &RequestId) -> SluiceError {
    SluiceError::new(
        ErrorCode::RequestClosed,
        format!("Request {} is already closed", id),
    )
}
