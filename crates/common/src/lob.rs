//! Large object values and the side store that holds externalized payloads.
//!
//! A [`Lob`] is either inline bytes, a stream still owned by the connector
//! that produced it, or a key into a [`LobStore`]. Stores are content
//! addressed: the key is the SHA-256 of the payload.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sluice_error::{ErrorCode, SluiceError};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LobError {
    #[error("LOB store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("LOB {0} not found in store")]
    NotFound(String),
    #[error("LOB source failed: {0}")]
    Source(String),
}

impl From<LobError> for SluiceError {
    fn from(err: LobError) -> Self {
        SluiceError::new(ErrorCode::LobUnavailable, err.to_string())
    }
}

/// A connector-owned large object that can be read without materializing it.
pub trait LobSource: Send + Sync {
    /// Total length in bytes, when known up front.
    fn length(&self) -> Option<u64>;

    /// Reads up to `len` bytes at `offset`. An empty result means end of data.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, LobError>;

    /// Whether the source is only valid while the connector call is open and
    /// must therefore be copied into a backing store before it is kept.
    fn requires_spill(&self) -> bool {
        false
    }
}

/// Key of a payload held by a [`LobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LobKey(pub String);

impl fmt::Display for LobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub enum Lob {
    Inline(Arc<[u8]>),
    Streamed(Arc<dyn LobSource>),
    Stored(LobKey),
}

impl Lob {
    pub fn inline(bytes: Vec<u8>) -> Self {
        Lob::Inline(Arc::from(bytes))
    }

    pub fn is_streamed(&self) -> bool {
        matches!(self, Lob::Streamed(_))
    }

    /// Payload length when it is known without reading the payload.
    pub fn length(&self) -> Option<u64> {
        match self {
            Lob::Inline(bytes) => Some(bytes.len() as u64),
            Lob::Streamed(source) => source.length(),
            Lob::Stored(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Lob::Inline(bytes) => format!("inline:{}", content_key(bytes)),
            Lob::Streamed(source) => format!("streamed:{:p}", Arc::as_ptr(source)),
            Lob::Stored(key) => format!("stored:{}", key),
        }
    }

    /// Reads one chunk starting at `offset`; an empty chunk means end of data.
    pub fn read_chunk(
        &self,
        store: &dyn LobStore,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, LobError> {
        match self {
            Lob::Inline(bytes) => Ok(slice_at(bytes, offset, len)),
            Lob::Streamed(source) => source.read(offset, len),
            Lob::Stored(key) => store.read(key, offset, len),
        }
    }

    /// Reads the whole payload.
    pub fn materialize(&self, store: &dyn LobStore) -> Result<Vec<u8>, LobError> {
        match self {
            Lob::Inline(bytes) => Ok(bytes.to_vec()),
            Lob::Stored(key) => store.get(key),
            Lob::Streamed(source) => {
                let mut out = Vec::new();
                loop {
                    let chunk = source.read(out.len() as u64, 64 * 1024)?;
                    if chunk.is_empty() {
                        break;
                    }
                    out.extend_from_slice(&chunk);
                }
                Ok(out)
            }
        }
    }
}

impl fmt::Debug for Lob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lob::Inline(bytes) => write!(f, "Lob::Inline({} bytes)", bytes.len()),
            Lob::Streamed(source) => write!(f, "Lob::Streamed(length={:?})", source.length()),
            Lob::Stored(key) => write!(f, "Lob::Stored({})", key),
        }
    }
}

impl PartialEq for Lob {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Lob::Inline(a), Lob::Inline(b)) => a == b,
            (Lob::Stored(a), Lob::Stored(b)) => a == b,
            (Lob::Streamed(a), Lob::Streamed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn slice_at(bytes: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
    let end = start.saturating_add(len).min(bytes.len());
    bytes[start..end].to_vec()
}

/// SHA-256 hex digest used as the content address of a payload.
pub fn content_key(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Side store for externalized LOB payloads.
pub trait LobStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<LobKey, LobError>;

    fn get(&self, key: &LobKey) -> Result<Vec<u8>, LobError>;

    fn read(&self, key: &LobKey, offset: u64, len: usize) -> Result<Vec<u8>, LobError> {
        Ok(slice_at(&self.get(key)?, offset, len))
    }

    fn remove(&self, key: &LobKey) -> Result<(), LobError>;
}

/// Keeps payloads in process memory.
#[derive(Default)]
pub struct MemoryLobStore {
    payloads: Mutex<HashMap<LobKey, Arc<[u8]>>>,
}

impl MemoryLobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LobStore for MemoryLobStore {
    fn put(&self, bytes: &[u8]) -> Result<LobKey, LobError> {
        let key = LobKey(content_key(bytes));
        self.payloads
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::from(bytes));
        Ok(key)
    }

    fn get(&self, key: &LobKey) -> Result<Vec<u8>, LobError> {
        self.payloads
            .lock()
            .get(key)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| LobError::NotFound(key.to_string()))
    }

    fn remove(&self, key: &LobKey) -> Result<(), LobError> {
        self.payloads.lock().remove(key);
        Ok(())
    }
}

/// Keeps payloads as files in a directory, one file per content key.
pub struct FileLobStore {
    directory: PathBuf,
}

impl FileLobStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, LobError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        debug!(target: "cache", directory = ?directory, "Opened file LOB store");
        Ok(Self { directory })
    }

    fn path_for(&self, key: &LobKey) -> PathBuf {
        self.directory.join(format!("{}.lob", key.0))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl LobStore for FileLobStore {
    fn put(&self, bytes: &[u8]) -> Result<LobKey, LobError> {
        let key = LobKey(content_key(bytes));
        let path = self.path_for(&key);
        if path.exists() {
            return Ok(key);
        }

        // One temporary file per writer, renamed into place
        let mut tmp = tempfile::NamedTempFile::new_in(&self.directory)?;
        tmp.write_all(bytes)?;
        tmp.persist(&path).map_err(|e| LobError::Io(e.error))?;
        Ok(key)
    }

    fn get(&self, key: &LobKey) -> Result<Vec<u8>, LobError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LobError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &LobKey) -> Result<(), LobError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(target: "cache", key = %key, error = %e, "Failed to delete LOB file");
                Err(e.into())
            }
        }
    }
}
