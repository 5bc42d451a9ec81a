use serde::{Deserialize, Serialize};
use sluice_common::types::Row;

use super::delivery::RowWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    New,
    Processing,
    /// Terminal. Re-entered until finalization completes.
    Close,
}

impl From<ProcessingState> for u8 {
    fn from(state: ProcessingState) -> Self {
        match state {
            ProcessingState::New => 0,
            ProcessingState::Processing => 1,
            ProcessingState::Close => 2,
        }
    }
}

impl From<u8> for ProcessingState {
    fn from(value: u8) -> Self {
        match value {
            0 => ProcessingState::New,
            1 => ProcessingState::Processing,
            _ => ProcessingState::Close,
        }
    }
}

/// Lifecycle of a request-scoped transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    None,
    Active,
    Ending,
    Done,
}

impl From<TransactionState> for u8 {
    fn from(state: TransactionState) -> Self {
        match state {
            TransactionState::None => 0,
            TransactionState::Active => 1,
            TransactionState::Ending => 2,
            TransactionState::Done => 3,
        }
    }
}

impl From<u8> for TransactionState {
    fn from(value: u8) -> Self {
        match value {
            0 => TransactionState::None,
            1 => TransactionState::Active,
            2 => TransactionState::Ending,
            _ => TransactionState::Done,
        }
    }
}

/// Rows produced so far. Row numbers are 1-based.
#[derive(Debug, Default)]
pub(crate) struct ResultBuffer {
    rows: Vec<Row>,
    final_row: Option<u64>,
}

impl ResultBuffer {
    pub(crate) fn complete(rows: Vec<Row>) -> Self {
        let final_row = Some(rows.len() as u64);
        Self { rows, final_row }
    }

    pub(crate) fn append(&mut self, rows: Vec<Row>) {
        self.rows.extend(rows);
    }

    pub(crate) fn finish(&mut self) {
        self.final_row = Some(self.rows.len() as u64);
    }

    pub(crate) fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub(crate) fn final_row(&self) -> Option<u64> {
        self.final_row
    }

    pub(crate) fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Rows of `window` that exist, clipped to what has been produced.
    pub(crate) fn window(&self, window: RowWindow) -> &[Row] {
        let len = self.rows.len();
        let start = usize::try_from(window.begin - 1).unwrap_or(usize::MAX).min(len);
        let end = usize::try_from(window.end).unwrap_or(usize::MAX).min(len);
        &self.rows[start..end.max(start)]
    }

    pub(crate) fn release(&mut self) {
        self.rows = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::types::Value;

    fn rows(n: i64) -> Vec<Row> {
        (1..=n).map(|i| vec![Value::Integer(i)]).collect()
    }

    #[test]
    fn test_window_is_one_based_and_clipped() {
        let mut buffer = ResultBuffer::default();
        buffer.append(rows(5));

        let window = buffer.window(RowWindow::new(2, 3).unwrap());
        assert_eq!(window, &rows(3)[1..3]);
        assert_eq!(buffer.window(RowWindow::new(4, 10).unwrap()).len(), 2);
        assert!(buffer.window(RowWindow::new(9, 10).unwrap()).is_empty());
        assert_eq!(buffer.final_row(), None);

        buffer.finish();
        assert_eq!(buffer.final_row(), Some(5));
    }

    #[test]
    fn test_state_mirrors_roundtrip() {
        for state in [
            ProcessingState::New,
            ProcessingState::Processing,
            ProcessingState::Close,
        ] {
            assert_eq!(ProcessingState::from(u8::from(state)), state);
        }
        assert_eq!(
            TransactionState::from(u8::from(TransactionState::Ending)),
            TransactionState::Ending
        );
    }
}
