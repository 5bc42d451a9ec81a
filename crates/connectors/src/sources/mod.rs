//! Connector implementations bundled with the engine.
//!
//! | Connector | Implementation | Description |
//! |-----------|----------------|-------------|
//! | `memory`  | `MemoryConnector` | Named in-memory tables with scriptable downstream behavior |

pub mod memory;

pub use memory::{CallKind, CallRecord, MemoryConnector, MemoryLobSource, MemoryTable};
