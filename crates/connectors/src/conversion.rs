//! Per-row normalization of connector output to the types a plan expects.
//!
//! Two per-column flags track whether a column still needs the type
//! conversion pass and the LOB wrapping pass. A flag is cleared after a batch
//! in which that pass changed nothing for the column. Clearing is only a
//! shortcut: [`canonicalize`] runs on every value and produces the same result
//! whether or not a flag is still set.

use std::sync::Arc;

use sluice_common::lob::{Lob, LobStore};
use sluice_common::types::{coerce, ColumnSchema, DataType, Row, Value};
use sluice_error::{ErrorCode, Result, SluiceError};
use tracing::trace;

/// Rows after conversion, plus whether any value still references a
/// connector-owned stream.
#[derive(Debug)]
pub struct ConvertedBatch {
    pub rows: Vec<Row>,
    pub has_streamed_lobs: bool,
}

pub struct RowConverter {
    desired: Vec<DataType>,
    needs_runtime: Vec<bool>,
    needs_lob_wrap: Vec<bool>,
    store: Arc<dyn LobStore>,
}

impl RowConverter {
    pub fn new(columns: &[ColumnSchema], store: Arc<dyn LobStore>) -> Self {
        let desired: Vec<DataType> = columns.iter().map(|c| c.data_type).collect();
        let needs_runtime = desired.iter().map(|t| *t != DataType::Object).collect();
        let needs_lob_wrap = desired.iter().map(|t| t.is_lob()).collect();
        Self {
            desired,
            needs_runtime,
            needs_lob_wrap,
            store,
        }
    }

    pub fn columns_pending_conversion(&self) -> usize {
        self.needs_runtime
            .iter()
            .zip(&self.needs_lob_wrap)
            .filter(|(runtime, lob)| **runtime || **lob)
            .count()
    }

    pub fn convert(&mut self, rows: Vec<Row>) -> Result<ConvertedBatch> {
        let width = self.desired.len();
        let mut runtime_used = vec![false; width];
        let mut lob_used = vec![false; width];
        let mut has_streamed_lobs = false;
        let mut converted = Vec::with_capacity(rows.len());

        for row in rows {
            if row.len() != width {
                return Err(SluiceError::new(
                    ErrorCode::ConversionFailed,
                    format!("Row has {} values, expected {}", row.len(), width),
                ));
            }
            let mut out = Vec::with_capacity(width);
            for (column, value) in row.into_iter().enumerate() {
                let target = self.desired[column];
                let mut value = value;

                if self.needs_runtime[column]
                    && !value.is_null()
                    && value.data_type() != Some(target)
                {
                    value = coerce(value, target)?;
                    runtime_used[column] = true;
                }

                if self.needs_lob_wrap[column] {
                    if let Some(lob) = value.as_lob() {
                        if lob.is_streamed() {
                            lob_used[column] = true;
                        }
                    }
                }

                let (value, streamed) = canonicalize(value, target, self.store.as_ref())?;
                has_streamed_lobs |= streamed;
                out.push(value);
            }
            converted.push(out);
        }

        if !converted.is_empty() {
            for column in 0..width {
                if self.needs_runtime[column] && !runtime_used[column] {
                    trace!(target: "connector", column, "Column needs no further type conversion");
                    self.needs_runtime[column] = false;
                }
                if self.needs_lob_wrap[column] && !lob_used[column] {
                    self.needs_lob_wrap[column] = false;
                }
            }
        }

        Ok(ConvertedBatch {
            rows: converted,
            has_streamed_lobs,
        })
    }
}

/// Brings one value into its canonical form for `target`.
///
/// Coerces a mismatched runtime type, folds `-0.0` and every NaN payload to a
/// single representation, and copies connector streams that cannot outlive
/// the call into `store`. Returns whether the value still borrows a
/// connector stream.
pub fn canonicalize(value: Value, target: DataType, store: &dyn LobStore) -> Result<(Value, bool)> {
    let value = if !value.is_null() && target != DataType::Object && value.data_type() != Some(target)
    {
        coerce(value, target)?
    } else {
        value
    };

    let canonical = match value {
        Value::Double(d) if d == 0.0 => Value::Double(0.0),
        Value::Double(d) if d.is_nan() => Value::Double(f64::NAN),
        Value::Blob(lob) => {
            let (lob, streamed) = settle_lob(lob, store)?;
            return Ok((Value::Blob(lob), streamed));
        }
        Value::Clob(lob) => {
            let (lob, streamed) = settle_lob(lob, store)?;
            return Ok((Value::Clob(lob), streamed));
        }
        other => other,
    };
    Ok((canonical, false))
}

fn settle_lob(lob: Lob, store: &dyn LobStore) -> Result<(Lob, bool)> {
    match lob {
        Lob::Streamed(source) if source.requires_spill() => {
            let bytes = Lob::Streamed(source).materialize(store)?;
            let key = store.put(&bytes)?;
            trace!(target: "connector", key = %key, bytes = bytes.len(), "Spilled LOB to store");
            Ok((Lob::Stored(key), false))
        }
        Lob::Streamed(source) => Ok((Lob::Streamed(source), true)),
        other => Ok((other, false)),
    }
}
