//! Downstream connectors and the adapter that polls them.
//!
//! A [`connector::Connector`] creates one [`connector::SourceExecution`] per
//! downstream call. The engine never awaits an execution directly: the
//! [`adapter::ConnectorPollAdapter`] runs each `execute`/`more` call on the
//! async runtime and exposes the outcome through a non-blocking `poll()`.
//!
//! # Adding a New Connector
//!
//! 1. Implement `SourceExecution` for a single downstream call.
//! 2. Implement `Connector::create_execution` to build it from a `SourceCommand`.
//! 3. Register the connector with a `ConnectorRegistry` under a unique name.

pub mod adapter;
pub mod connector;
pub mod conversion;
pub mod sources;

pub use adapter::{CallState, CloseOutcome, ConnectorPollAdapter, SourceBatch, SourcePoll};
pub use connector::{
    Connector, ConnectorRegistry, ExecutionContext, SourceCommand, SourceExecution,
    SourceResponse,
};
