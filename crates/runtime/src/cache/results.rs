use std::sync::Arc;

use sluice_common::lob::{Lob, LobStore};
use sluice_common::models::Determinism;
use sluice_common::types::{ColumnSchema, Row, Value};
use sluice_error::Result;

use super::Cachable;

/// A complete result set held by the result cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResults {
    pub columns: Arc<Vec<ColumnSchema>>,
    pub rows: Arc<Vec<Row>>,
    pub determinism: Determinism,
}

impl CachedResults {
    /// Captures rows produced by a request. Connector streams are copied into
    /// `store` since the calls that own them close with the request.
    pub fn capture(
        columns: Vec<ColumnSchema>,
        rows: &[Row],
        determinism: Determinism,
        store: &dyn LobStore,
    ) -> Result<Self> {
        let rows = map_lobs(rows, |lob| match lob {
            Lob::Streamed(_) => Ok(Lob::Stored(store.put(&lob.materialize(store)?)?)),
            other => Ok(other.clone()),
        })?;
        Ok(Self {
            columns: Arc::new(columns),
            rows: Arc::new(rows),
            determinism,
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

impl Cachable for CachedResults {
    /// Moves every LOB payload into the side store.
    fn prepare(&self, store: &dyn LobStore) -> Result<Self> {
        let rows = map_lobs(&self.rows, |lob| match lob {
            Lob::Stored(key) => Ok(Lob::Stored(key.clone())),
            other => Ok(Lob::Stored(store.put(&other.materialize(store)?)?)),
        })?;
        Ok(Self {
            rows: Arc::new(rows),
            ..self.clone()
        })
    }

    /// Reads LOB payloads back. Fails if any payload is gone from the store.
    fn restore(&self, store: &dyn LobStore) -> Result<Self> {
        let rows = map_lobs(&self.rows, |lob| match lob {
            Lob::Stored(key) => Ok(Lob::inline(store.get(key)?)),
            other => Ok(other.clone()),
        })?;
        Ok(Self {
            rows: Arc::new(rows),
            ..self.clone()
        })
    }
}

fn map_lobs(rows: &[Row], mut f: impl FnMut(&Lob) -> Result<Lob>) -> Result<Vec<Row>> {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|value| -> Result<Value> {
                    Ok(match value {
                        Value::Blob(lob) => Value::Blob(f(lob)?),
                        Value::Clob(lob) => Value::Clob(f(lob)?),
                        other => other.clone(),
                    })
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::lob::{LobKey, MemoryLobStore};
    use sluice_common::types::DataType;
    use sluice_connectors::sources::MemoryLobSource;

    fn columns() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema::new("id", DataType::Integer),
            ColumnSchema::new("doc", DataType::Clob),
        ]
    }

    #[test]
    fn test_capture_copies_connector_streams() {
        let store = MemoryLobStore::new();
        let source = Arc::new(MemoryLobSource::new(b"hello".to_vec()));
        let rows = vec![vec![Value::Integer(1), Value::Clob(Lob::Streamed(source))]];

        let results = CachedResults::capture(columns(), &rows, Determinism::Deterministic, &store)
            .unwrap();
        assert!(matches!(results.rows[0][1], Value::Clob(Lob::Stored(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_prepare_restore_roundtrip() {
        let store = MemoryLobStore::new();
        let rows = vec![vec![Value::Integer(1), Value::Clob(Lob::inline(b"doc".to_vec()))]];
        let results =
            CachedResults::capture(columns(), &rows, Determinism::User, &store).unwrap();

        let prepared = results.prepare(&store).unwrap();
        assert!(matches!(prepared.rows[0][1], Value::Clob(Lob::Stored(_))));
        let restored = prepared.restore(&store).unwrap();
        assert_eq!(restored.rows[0][1], Value::Clob(Lob::inline(b"doc".to_vec())));
    }

    #[test]
    fn test_restore_fails_when_payload_missing() {
        let store = MemoryLobStore::new();
        let results = CachedResults {
            columns: Arc::new(columns()),
            rows: Arc::new(vec![vec![
                Value::Integer(1),
                Value::Clob(Lob::Stored(LobKey("missing".into()))),
            ]]),
            determinism: Determinism::Deterministic,
        };
        assert!(results.restore(&store).is_err());
    }
}
